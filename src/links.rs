//! Builds the tracking URLs embedded in outgoing mail.

use crate::token::compute_token;
use anyhow::{Context, Result};
use url::Url;

pub fn pixel_url(base: &str, sender: &str, recipient: &str, sent: Option<&str>) -> Result<Url> {
    let mut url = endpoint(base, "pixel")?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("from", sender).append_pair("to", recipient);
        if let Some(sent) = sent {
            query.append_pair("sent", sent);
        }
    }
    Ok(url)
}

pub fn click_url(
    base: &str,
    sender: &str,
    recipient: &str,
    destination: &str,
    secret: &str,
) -> Result<Url> {
    let mut url = endpoint(base, "click")?;
    url.query_pairs_mut()
        .append_pair("from", sender)
        .append_pair("to", recipient)
        .append_pair("url", destination)
        .append_pair("token", &compute_token(sender, recipient, destination, secret));
    Ok(url)
}

fn endpoint(base: &str, path: &str) -> Result<Url> {
    let mut base = Url::parse(base).with_context(|| format!("Invalid base URL: {base}"))?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .with_context(|| format!("Failed to build {path} URL from {base}"))
}
