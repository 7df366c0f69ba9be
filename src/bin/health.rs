use std::env;

use anyhow::{bail, Result};
use url::Url;

const DEFAULT_PING_URL: &str = "http://localhost:8080/ping";

fn main() -> Result<()> {
    let url = env::args().nth(1);
    let url = Url::parse(url.as_deref().unwrap_or(DEFAULT_PING_URL))?;

    let response = reqwest::blocking::get(url.clone())?;
    if !response.status().is_success() {
        bail!("{url} answered {}", response.status())
    }

    Ok(())
}
