//! Readiness probing (component C5): polls a spawned child until it
//! reports ready, times out, or the probe is cancelled by a reload or
//! shutdown racing it.

use std::time::Duration;

use crate::host::{Clock, Net, Spawner};
use crate::process::ReadySpec;

pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parses a `ready=` option value into a [`ReadySpec`] (spec §4.5).
pub fn parse_ready_spec(value: &str) -> Result<ReadySpec, String> {
    if let Ok(port) = value.parse::<u16>() {
        return Ok(ReadySpec::Tcp(port));
    }
    if let Some(rest) = value.strip_prefix("http:") {
        let (port_and_path, expected_status) = match rest.rsplit_once('=') {
            Some((left, status)) => {
                let status: u16 = status
                    .parse()
                    .map_err(|_| format!("invalid expected status {status:?}"))?;
                (left, Some(status))
            }
            None => (rest, None),
        };
        let (port_str, path) = match port_and_path.split_once('/') {
            Some((p, rest_path)) => (p, format!("/{rest_path}")),
            None => (port_and_path, "/".to_string()),
        };
        let port: u16 = port_str
            .parse()
            .map_err(|_| format!("invalid port {port_str:?} in http ready spec"))?;
        return Ok(ReadySpec::Http {
            port,
            path,
            expected_status,
        });
    }
    if let Some(cmd) = value.strip_prefix("exec:") {
        if cmd.is_empty() {
            return Err("exec ready spec requires a command".to_string());
        }
        return Ok(ReadySpec::Exec(cmd.to_string()));
    }
    Err(format!("unrecognised ready spec {value:?}"))
}

/// Outcome of a single run of a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

/// Polls `spec` until ready, timeout, or `cancel` resolves.
///
/// `dir`/`env` are only used by the `Exec` variant, which shells out with
/// the child's own working directory and environment (spec §4.5).
pub async fn probe(
    spec: &ReadySpec,
    net: &dyn Net,
    clock: &dyn Clock,
    spawner: &dyn Spawner,
    dir: &str,
    env: &[(String, String)],
    cancel: tokio::sync::oneshot::Receiver<()>,
) -> ProbeOutcome {
    let deadline = clock.now() + PROBE_TIMEOUT;
    tokio::pin!(cancel);

    loop {
        if clock.now() >= deadline {
            return ProbeOutcome::TimedOut;
        }

        let attempt = probe_once(spec, net, spawner, dir, env);
        tokio::select! {
            biased;
            _ = &mut cancel => return ProbeOutcome::Cancelled,
            ok = attempt => {
                if ok {
                    return ProbeOutcome::Ready;
                }
            }
        }

        tokio::select! {
            biased;
            _ = &mut cancel => return ProbeOutcome::Cancelled,
            _ = clock.sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn probe_once(
    spec: &ReadySpec,
    net: &dyn Net,
    spawner: &dyn Spawner,
    dir: &str,
    env: &[(String, String)],
) -> bool {
    match spec {
        ReadySpec::Tcp(port) => net.tcp_connect("127.0.0.1", *port).await.is_ok(),
        ReadySpec::Http {
            port,
            path,
            expected_status,
        } => {
            let url = format!("http://127.0.0.1:{port}{path}");
            match net.http_get(&url).await {
                Ok(status) => match expected_status {
                    Some(expected) => status == *expected,
                    None => status < 500,
                },
                Err(_) => false,
            }
        }
        ReadySpec::Exec(cmd) => spawner
            .run_to_completion(cmd, dir, env)
            .await
            .map(|status| status.success())
            .unwrap_or(false),
    }
}
