//! ICMP liveness probe through the system `ping` binary.

use std::time::Duration;

use tracing::debug;

use crate::command;
use crate::error::Result;
use crate::types::PingResult;

/// Per-probe deadline.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends one echo request to `address` and waits at most [`PING_TIMEOUT`].
///
/// An unanswered probe is not an error; it yields a result with zero replies.
pub async fn ping_once(address: &str) -> Result<PingResult> {
    let wait = PING_TIMEOUT.as_secs().to_string();
    let out = command::run(
        "ping",
        &["-c", "1", "-W", &wait, "-n", address],
        &[],
        PING_TIMEOUT + Duration::from_secs(1),
    )
    .await;

    let result = match out {
        Ok(stdout) => parse_ping_output(&stdout),
        Err(e) => {
            debug!(address, error = %e, "ping failed");
            PingResult {
                packets_sent: 1,
                packets_recv: 0,
                rtts: Vec::new(),
            }
        }
    };
    Ok(result)
}

/// Extracts replies and round trip times from iputils `ping` output.
pub fn parse_ping_output(stdout: &str) -> PingResult {
    let mut result = PingResult {
        packets_sent: 1,
        ..PingResult::default()
    };
    for line in stdout.lines() {
        if let Some(idx) = line.find("time=") {
            let value: String = line[idx + 5..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if let Ok(ms) = value.parse::<f64>() {
                result.rtts.push(Duration::from_secs_f64(ms / 1000.0));
            }
        }
        if line.contains("packets transmitted") {
            let mut nums = line
                .split(',')
                .filter_map(|part| part.split_whitespace().next()?.parse::<u32>().ok());
            if let Some(sent) = nums.next() {
                result.packets_sent = sent;
            }
            if let Some(recv) = nums.next() {
                result.packets_recv = recv;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "PING 10.0.0.2 (10.0.0.2) 56(84) bytes of data.
64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=0.512 ms

--- 10.0.0.2 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 0.512/0.512/0.512/0.000 ms
";

    const LOST: &str = "PING 10.0.0.9 (10.0.0.9) 56(84) bytes of data.

--- 10.0.0.9 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";

    #[test]
    fn parses_reply() {
        let r = parse_ping_output(REPLY);
        assert_eq!(r.packets_sent, 1);
        assert_eq!(r.packets_recv, 1);
        assert!(r.is_pingable());
        assert_eq!(r.rtts.len(), 1);
        assert!((511..=512).contains(&r.rtts[0].as_micros()));
    }

    #[test]
    fn parses_loss() {
        let r = parse_ping_output(LOST);
        assert_eq!(r.packets_recv, 0);
        assert!(!r.is_pingable());
        assert!(r.rtts.is_empty());
    }
}
