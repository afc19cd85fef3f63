//! Small helpers shared by the client and the live feed

use rand::Rng;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::Result;

const SESSION_ID_LEN: usize = 12;

/// Random session id in the form `{prefix}_{12 lowercase letters}`
pub fn generate_session_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SESSION_ID_LEN)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect();
    format!("{}_{}", prefix, suffix)
}

pub fn generate_chart_session_id() -> String {
    generate_session_id("cs")
}

/// Mask all but the last `visible` characters. Short input gets a fixed mask.
pub fn mask_sensitive_data(data: &str, visible: usize) -> String {
    let chars: Vec<char> = data.chars().collect();
    if chars.len() <= visible {
        return "*".repeat(8);
    }
    let hidden = chars.len() - visible;
    let tail: String = chars[hidden..].iter().collect();
    format!("{}{}", "*".repeat(hidden), tail)
}

/// Exponential backoff delay for `attempt` (0-based) with +/-20% jitter
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let delay = base.saturating_mul(factor).min(max);
    let jitter: f64 = rand::thread_rng().gen_range(-0.2..=0.2);
    Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + jitter)).max(0.0))
}

/// Run `op` up to `max_retries + 1` times, backing off between attempts.
///
/// Only errors for which `TvError::is_transient` holds are retried.
pub fn retry_with_backoff<T, F>(
    mut op: F,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_retries => {
                error!("All {} retry attempts failed: {}", max_retries, e);
                return Err(e);
            }
            Err(e) => {
                let delay = backoff_delay(attempt, base_delay, max_delay);
                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:.2}s...",
                    attempt + 1,
                    max_retries,
                    e,
                    delay.as_secs_f64()
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Strip `<em>`/`</em>` highlight tags from search results
pub fn strip_highlight(text: &str) -> String {
    text.replace("<em>", "").replace("</em>", "")
}
