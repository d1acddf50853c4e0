use anyhow::bail;

use redfleet_reconciler::InstanceView;

use crate::client::ApiClient;

pub async fn status(client: &ApiClient, name: &str, format: &str) -> anyhow::Result<()> {
    let Some(view) = client.status(name).await? else {
        bail!("instance {name} not found");
    };
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&view)?),
        _ => print!("{}", format_view(&view)),
    }
    Ok(())
}

pub async fn delete(client: &ApiClient, name: &str) -> anyhow::Result<()> {
    if !client.delete(name).await? {
        bail!("instance {name} not found");
    }
    println!("✓ Deletion of {name} requested");
    Ok(())
}

pub async fn list(client: &ApiClient, format: &str) -> anyhow::Result<()> {
    let views = client.list().await?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&views)?),
        _ => print!("{}", format_table(&views)),
    }
    Ok(())
}

/// Multi-line description of one instance.
pub fn format_view(view: &InstanceView) -> String {
    let status = &view.status;
    let mut out = format!("Instance: {}\nPhase:    {}\n", status.name, status.phase);
    if let Some(spec) = &view.spec {
        out.push_str(&format!(
            "Memory:   {} MB\nSlaves:   {} wanted, {} launched\n",
            spec.memory_mb,
            spec.slave_count,
            status.slave_task_ids.len()
        ));
    }
    out.push_str(&format!(
        "Master:   {}\n",
        status.master_task_id.as_deref().unwrap_or("-")
    ));
    for id in &status.slave_task_ids {
        out.push_str(&format!("Slave:    {id}\n"));
    }
    if let Some(error) = &status.error {
        out.push_str(&format!("Error:    {error}\n"));
    }
    out
}

/// One row per instance.
pub fn format_table(views: &[InstanceView]) -> String {
    if views.is_empty() {
        return "No instances.\n".to_string();
    }
    let mut out = format!(
        "{:<24} {:<18} {:>8} {:>7}\n",
        "NAME", "PHASE", "MEM_MB", "SLAVES"
    );
    for view in views {
        let memory = view
            .spec
            .as_ref()
            .map_or_else(|| "-".to_string(), |s| s.memory_mb.to_string());
        out.push_str(&format!(
            "{:<24} {:<18} {:>8} {:>7}\n",
            view.status.name,
            view.status.phase.to_string(),
            memory,
            view.status.slave_task_ids.len()
        ));
    }
    out
}
