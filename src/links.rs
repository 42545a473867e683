use std::collections::HashSet;

use scraper::{Html, Selector};
use url::Url;

use crate::fetch::is_overlay_address;

pub const MAX_LINKS: usize = 10;

/// Collects up to [`MAX_LINKS`] distinct outbound addresses from `html`.
pub fn enumerate(html: &str, base_address: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base = Url::parse(base_address).ok();
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&selector) {
        if links.len() >= MAX_LINKS {
            break;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(link) = resolve_link(href, base.as_ref()) else {
            continue;
        };
        if seen.insert(link.clone()) {
            links.push(link);
        }
    }
    links
}

fn resolve_link(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }

    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(href.to_owned());
    }
    if !href.contains("://") && !href.starts_with('/') && is_overlay_address(href) {
        return Some(href.to_owned());
    }

    let resolved = base?.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_and_drops_non_navigational_links() {
        let html = r##"
            <a href="https://other.example/x">abs</a>
            <a href="/root">root</a>
            <a href="child">child</a>
            <a href="#top">frag</a>
            <a href="javascript:void(0)">js</a>
            <a href="mailto:a@b.c">mail</a>
            <a href="tel:123">tel</a>
            <a href="xyz.onion/page">onion</a>
            <a href="ftp://files.example/x">ftp</a>
        "##;
        let links = enumerate(html, "http://forum.example/board/page");
        assert_eq!(
            links,
            vec![
                "https://other.example/x".to_owned(),
                "http://forum.example/root".to_owned(),
                "http://forum.example/board/child".to_owned(),
                "xyz.onion/page".to_owned(),
            ]
        );
    }

    #[test]
    fn caps_at_ten_distinct_links() {
        let mut html = String::new();
        for i in 0..25 {
            html.push_str(&format!("<a href=\"/p{i}\">p{i}</a><a href=\"/p{i}\">again</a>"));
        }
        let links = enumerate(&html, "http://forum.example/");
        assert_eq!(links.len(), MAX_LINKS);
        let distinct: HashSet<_> = links.iter().collect();
        assert_eq!(distinct.len(), MAX_LINKS);
    }
}
