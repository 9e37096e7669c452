use url::Url;

/// Normalize a relay address for use as a map key.
///
/// Only `ws` and `wss` are accepted. The host is lowercased, default ports and
/// fragments are dropped, a bare host gets a trailing `/` and any other path
/// loses its trailing `/`. Returns `None` for anything that is not a relay URL.
pub fn normalize_relay_url(address: &str) -> Option<String> {
    let mut url = Url::parse(address.trim()).ok()?;
    if !matches!(url.scheme(), "ws" | "wss") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);

    let path = url.path().trim_end_matches('/').to_string();
    if path.is_empty() {
        url.set_path("/");
    } else {
        url.set_path(&path);
    }
    Some(url.to_string())
}
