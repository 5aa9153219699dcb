//! # Readiness Probe Evaluation
//!
//! Purpose: Decide, from one INFO-style introspection reply, whether a
//! freshly connected server is usable now, needs another probe later, or
//! has failed the connection attempt.
//!
//! ## Design Principles
//! 1. **Pure Decisions**: No timers, no IO; the connection owns scheduling
//!    and this module only maps probe replies to outcomes.
//! 2. **Old Servers Count As Ready**: A server that does not know the probe
//!    command predates the readiness protocol and is ready by definition.

use std::time::Duration;

use pkv_wire::RespValue;

use crate::error::{EngineError, EngineResult};

/// Retry delays are capped so a wildly wrong server ETA cannot stall the
/// handshake for long.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A replica whose upstream link is still down is retried on a short fixed
/// cadence; it gives no useful ETA.
pub(crate) const LINK_DOWN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Connection lifecycle state around the ready handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// No usable transport.
    Connecting,
    /// Transport connected, readiness probe outstanding.
    ReadyCheckPending,
    /// Server reported it is still loading; another probe is scheduled.
    StillLoading,
    /// Server accepted the handshake; normal traffic flows.
    Ready,
}

/// What to do after a probe reply.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Ready,
    RetryAfter(Duration),
    Fatal(EngineError),
}

/// Fields of the introspection blob the handshake consumes.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ServerInfo {
    loading: bool,
    loading_eta_seconds: Option<f64>,
    master_link_up: Option<bool>,
}

/// Parses the `key:value` line format of an INFO reply. Unknown keys and
/// section headers are skipped.
pub(crate) fn parse_info(blob: &[u8]) -> ServerInfo {
    let mut info = ServerInfo::default();
    for line in blob.split(|byte| *byte == b'\n') {
        let line = trim_ascii(line);
        if line.is_empty() || line[0] == b'#' {
            continue;
        }
        let Some(colon) = line.iter().position(|byte| *byte == b':') else {
            continue;
        };
        let (key, value) = (&line[..colon], &line[colon + 1..]);
        match key {
            b"loading" => info.loading = value != b"0",
            b"loading_eta_seconds" => {
                info.loading_eta_seconds = std::str::from_utf8(value)
                    .ok()
                    .and_then(|text| text.parse().ok());
            }
            b"master_link_status" => info.master_link_up = Some(value == b"up"),
            _ => {}
        }
    }
    info
}

/// Maps a settled probe reply to the next handshake step.
pub(crate) fn evaluate_probe(result: &EngineResult<RespValue>) -> ProbeOutcome {
    let reply = match result {
        Ok(reply) => reply,
        // Servers that predate the probe command are treated as ready.
        Err(EngineError::Server(message)) if is_unknown_command(message) => {
            return ProbeOutcome::Ready;
        }
        Err(err) => return ProbeOutcome::Fatal(EngineError::ReadyCheck(err.to_string())),
    };

    let blob = match reply {
        RespValue::Bulk(Some(blob)) if !blob.is_empty() => blob,
        // Some servers reply without any info payload; nothing to wait for.
        _ => return ProbeOutcome::Ready,
    };

    let info = parse_info(blob);
    if !info.loading {
        if info.master_link_up == Some(false) {
            return ProbeOutcome::RetryAfter(LINK_DOWN_RETRY_DELAY);
        }
        return ProbeOutcome::Ready;
    }

    let eta = info.loading_eta_seconds.unwrap_or(0.0).max(0.0);
    ProbeOutcome::RetryAfter(Duration::from_secs_f64(eta).min(MAX_RETRY_DELAY))
}

fn is_unknown_command(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("unknown command")
}

fn trim_ascii(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_reply(blob: &str) -> EngineResult<RespValue> {
        Ok(RespValue::Bulk(Some(blob.as_bytes().to_vec())))
    }

    #[test]
    fn loaded_server_is_ready() {
        let reply = info_reply("# Persistence\r\nloading:0\r\nrole:master\r\n");
        assert_eq!(evaluate_probe(&reply), ProbeOutcome::Ready);
    }

    #[test]
    fn missing_loading_field_is_ready() {
        let reply = info_reply("role:master\r\n");
        assert_eq!(evaluate_probe(&reply), ProbeOutcome::Ready);
    }

    #[test]
    fn empty_info_payload_is_ready() {
        assert_eq!(
            evaluate_probe(&Ok(RespValue::Bulk(None))),
            ProbeOutcome::Ready
        );
        assert_eq!(
            evaluate_probe(&Ok(RespValue::Bulk(Some(Vec::new())))),
            ProbeOutcome::Ready
        );
    }

    #[test]
    fn loading_retries_after_reported_eta() {
        let reply = info_reply("loading:1\r\nloading_eta_seconds:0.25\r\n");
        assert_eq!(
            evaluate_probe(&reply),
            ProbeOutcome::RetryAfter(Duration::from_millis(250))
        );
    }

    #[test]
    fn loading_eta_is_capped() {
        let reply = info_reply("loading:1\r\nloading_eta_seconds:30\r\n");
        assert_eq!(
            evaluate_probe(&reply),
            ProbeOutcome::RetryAfter(MAX_RETRY_DELAY)
        );
    }

    #[test]
    fn replica_with_link_down_retries_shortly() {
        let reply = info_reply("loading:0\r\nmaster_link_status:down\r\n");
        assert_eq!(
            evaluate_probe(&reply),
            ProbeOutcome::RetryAfter(LINK_DOWN_RETRY_DELAY)
        );
    }

    #[test]
    fn replica_with_link_up_is_ready() {
        let reply = info_reply("loading:0\r\nmaster_link_status:up\r\n");
        assert_eq!(evaluate_probe(&reply), ProbeOutcome::Ready);
    }

    #[test]
    fn unknown_command_error_is_ready() {
        let result = Err(EngineError::Server("ERR unknown command 'info'".into()));
        assert_eq!(evaluate_probe(&result), ProbeOutcome::Ready);
    }

    #[test]
    fn other_probe_failures_are_fatal() {
        let result = Err(EngineError::Server("LOADING busy".into()));
        match evaluate_probe(&result) {
            ProbeOutcome::Fatal(EngineError::ReadyCheck(message)) => {
                assert!(message.contains("LOADING"));
            }
            other => panic!("expected fatal outcome, got {other:?}"),
        }
    }

    #[test]
    fn parses_info_fields() {
        let info = parse_info(b"# Replication\r\nloading:1\r\nloading_eta_seconds:2.5\r\nmaster_link_status:down\r\n");
        assert_eq!(
            info,
            ServerInfo {
                loading: true,
                loading_eta_seconds: Some(2.5),
                master_link_up: Some(false),
            }
        );
    }
}
