use std::future::Future;
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use tracing::debug;

use redfleet_core::PollPolicy;
use redfleet_reconciler::{CreateRequest, InstanceView};
use redfleet_state::{InstancePhase, InstanceStatus, clamp_memory, clamp_slaves};

use crate::client::ApiClient;

/// Build a create request, applying the same size coercion as the daemon.
pub fn build_request(name: &str, memory_mb: i64, slave_count: i64) -> anyhow::Result<CreateRequest> {
    let name = name.trim();
    if name.is_empty() {
        bail!("instance name must not be empty");
    }
    Ok(CreateRequest {
        name: name.to_string(),
        memory_mb: clamp_memory(memory_mb) as i64,
        slave_count: i64::from(clamp_slaves(slave_count)),
    })
}

pub async fn create(
    client: &ApiClient,
    name: &str,
    memory_mb: i64,
    slave_count: i64,
    wait: bool,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let req = build_request(name, memory_mb, slave_count)?;
    if req.memory_mb != memory_mb || req.slave_count != slave_count {
        println!(
            "note: adjusted to {} MB with {} slaves",
            req.memory_mb, req.slave_count
        );
    }

    let spec = client.create(&req).await?;
    println!(
        "✓ Created instance {} ({} MB, {} slaves)",
        spec.name, spec.memory_mb, spec.slave_count
    );

    if !wait {
        return Ok(());
    }

    let policy = PollPolicy::default().with_timeout(timeout_secs.map(Duration::from_secs));
    print!("Waiting for {} to start", spec.name);
    std::io::stdout().flush()?;
    let name = spec.name.as_str();
    let status = wait_until_running(
        &policy,
        name,
        move || client.status(name),
        &mut std::io::stdout(),
    )
    .await;
    println!();

    let status = status?;
    println!(
        "✓ {} is running (master {}, {} slaves)",
        spec.name,
        status.master_task_id.as_deref().unwrap_or("-"),
        status.slave_task_ids.len()
    );
    Ok(())
}

/// Poll `fetch` until the instance reports `Running`.
///
/// Writes one `.` to `progress` every `policy.progress_every` polls. Gives
/// up when the instance fails, is deleted, disappears, or `policy.timeout`
/// passes. A single poll never runs past the timeout. Failed polls are
/// retried.
pub async fn wait_until_running<F, Fut>(
    policy: &PollPolicy,
    name: &str,
    mut fetch: F,
    progress: &mut dyn Write,
) -> anyhow::Result<InstanceStatus>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<InstanceView>>>,
{
    let started = Instant::now();
    let mut polls: u32 = 0;

    loop {
        polls = polls.saturating_add(1);
        let answer = match policy.remaining(started.elapsed()) {
            Some(left) => tokio::time::timeout(left, fetch())
                .await
                .unwrap_or_else(|_| Err(anyhow!("status poll cut short by the wait timeout"))),
            None => fetch().await,
        };
        match answer {
            Ok(Some(view)) => match view.status.phase {
                InstancePhase::Running => return Ok(view.status),
                InstancePhase::Failed => bail!(
                    "instance {name} failed: {}",
                    view.status.error.as_deref().unwrap_or("no reason recorded")
                ),
                InstancePhase::DeleteRequested | InstancePhase::Deleted => {
                    bail!("instance {name} is being deleted")
                }
                InstancePhase::Pending | InstancePhase::Starting => {}
            },
            Ok(None) => bail!("instance {name} not found"),
            Err(e) => debug!(error = %e, "status poll failed, retrying"),
        }

        if policy.is_progress_tick(polls) {
            write!(progress, ".")?;
            progress.flush()?;
        }
        if policy.expired(started.elapsed()) {
            bail!(
                "timed out after {}s waiting for {name} to run",
                started.elapsed().as_secs()
            );
        }
        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn view(phase: InstancePhase) -> InstanceView {
        let mut status = InstanceStatus::pending("cache1", 0);
        status.phase = phase;
        InstanceView { status, spec: None }
    }

    fn fast(progress_every: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            progress_every,
            timeout: None,
        }
    }

    /// Replays `script`, then keeps repeating its last answer.
    fn scripted(
        script: Vec<anyhow::Result<Option<InstanceView>>>,
    ) -> impl FnMut() -> std::future::Ready<anyhow::Result<Option<InstanceView>>> {
        let mut queue = VecDeque::from(script);
        move || {
            let next = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                match queue.front().unwrap() {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(anyhow::anyhow!(e.to_string())),
                }
            };
            std::future::ready(next)
        }
    }

    #[test]
    fn request_is_clamped() {
        let req = build_request("cache1", 10, 150).unwrap();
        assert_eq!(req.memory_mb, 100);
        assert_eq!(req.slave_count, 0);

        let req = build_request(" cache1 ", 256, 2).unwrap();
        assert_eq!(req.name, "cache1");
        assert_eq!((req.memory_mb, req.slave_count), (256, 2));
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(build_request("", 256, 1).is_err());
        assert!(build_request("   ", 256, 1).is_err());
    }

    #[tokio::test]
    async fn waits_through_pending_and_starting() {
        let fetch = scripted(vec![
            Ok(Some(view(InstancePhase::Pending))),
            Ok(Some(view(InstancePhase::Starting))),
            Err(anyhow::anyhow!("connection refused")),
            Ok(Some(view(InstancePhase::Running))),
        ]);
        let mut out = Vec::new();
        let status = wait_until_running(&fast(1), "cache1", fetch, &mut out)
            .await
            .unwrap();
        assert_eq!(status.phase, InstancePhase::Running);
        assert_eq!(out, b"...");
    }

    #[tokio::test]
    async fn progress_mark_every_nth_poll() {
        let mut script: Vec<_> = (0..25).map(|_| Ok(Some(view(InstancePhase::Pending)))).collect();
        script.push(Ok(Some(view(InstancePhase::Running))));
        let mut out = Vec::new();
        wait_until_running(&fast(10), "cache1", scripted(script), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"..");
    }

    #[tokio::test]
    async fn failed_instance_stops_the_wait() {
        let mut failed = view(InstancePhase::Failed);
        failed.status.error = Some("master task lost".into());
        let fetch = scripted(vec![Ok(Some(failed))]);
        let err = wait_until_running(&fast(10), "cache1", fetch, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("master task lost"));
    }

    #[tokio::test]
    async fn vanished_instance_stops_the_wait() {
        let fetch = scripted(vec![Ok(None)]);
        let err = wait_until_running(&fast(10), "cache1", fetch, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn timeout_caps_a_hung_poll() {
        let fetch = || std::future::pending::<anyhow::Result<Option<InstanceView>>>();
        let policy = fast(10).with_timeout(Some(Duration::from_millis(30)));
        let waited = tokio::time::timeout(
            Duration::from_secs(5),
            wait_until_running(&policy, "cache1", fetch, &mut Vec::new()),
        )
        .await
        .expect("wait outlived its timeout");
        assert!(waited.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn timeout_caps_the_wait() {
        let fetch = scripted(vec![Ok(Some(view(InstancePhase::Pending)))]);
        let policy = fast(10).with_timeout(Some(Duration::from_millis(30)));
        let err = wait_until_running(&policy, "cache1", fetch, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
