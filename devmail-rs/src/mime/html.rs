//! HTML body sanitizing for the inspector

/// Clean an HTML body with a user-generated-content policy
///
/// Keeps `target` on links, `<link>` elements and `cid:` image sources so
/// inline attachments keep rendering.
pub fn sanitize_html(html: &str) -> String {
    ammonia::Builder::default()
        .add_tags(&["link"])
        .add_tag_attributes("a", &["target"])
        .add_tag_attributes("link", &["href", "type", "media"])
        .add_url_schemes(&["cid"])
        .clean(html)
        .to_string()
}
