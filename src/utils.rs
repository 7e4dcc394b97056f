use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::Context;
use rand::{Rng, distributions::Alphanumeric};
use regex::Regex;
use time::OffsetDateTime;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"));

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex")
});

/// "Rust for Rustaceans!" -> "rust-for-rustaceans"
pub fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    NON_SLUG
        .replace_all(&lower, "-")
        .trim_matches('-')
        .to_string()
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL.is_match(email)
}

/// Uppercase alphanumeric token, used for order numbers and generated coupon codes
pub fn random_code(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect()
}

/// Install the global subscriber. Logs go to `log_dir` (rotated daily) or stdout.
/// Keep the returned guard alive for the life of the process.
pub fn init_log(log_dir: Option<PathBuf>) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,tower_http=info"));
    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(true);
    let (writer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "course_server.log"))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    tracing::subscriber::set_global_default(builder.with_writer(writer).finish())
        .context("a global subscriber is already installed")?;
    Ok(guard)
}
