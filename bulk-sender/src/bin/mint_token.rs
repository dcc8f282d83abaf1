//! Issue a bearer token for the administrative endpoints.
//!
//! Usage: `AUTH_SIGNING_KEY=... bulk-sender-token <subject>`
//!
//! Prints the token on stdout.

use anyhow::{bail, Context, Result};

use bulksend::auth::issue_token_now;

fn main() -> Result<()> {
    let key = std::env::var("AUTH_SIGNING_KEY").context("AUTH_SIGNING_KEY is not set")?;
    let subject = std::env::args()
        .nth(1)
        .context("usage: bulk-sender-token <subject>")?;

    let token = match issue_token_now(key.trim(), subject.trim()) {
        Some(token) => token,
        None => bail!("signing key and subject must be non-empty"),
    };

    println!("{}", token);
    Ok(())
}
