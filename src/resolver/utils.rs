//! HTML extraction helpers: anchors, mirror links, titles, challenge markers.
//!
//! Pages are scanned with regular expressions rather than a DOM parser; the
//! catalog and mirror pages are simple enough that anchors and a handful of
//! headline elements are all that is needed.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Compiles a regex at static init; panics on invalid pattern.
pub fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<a\b([^>]*)>(.*?)</a>"));

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
});

static TEXT_3XL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r#"(?is)<div\b[^>]*\bclass\s*=\s*["'][^"']*\btext-3xl\b[^"']*["'][^>]*>(.*?)</div>"#,
    )
});

static H1_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?is)<h1\b[^>]*>(.*?)</h1>"));

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?s)<[^>]*>"));

static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"&#(?:[xX]([0-9a-fA-F]+)|([0-9]+));"));

/// Markers that identify an anti-bot interstitial instead of real content.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge",
    "challenge-platform",
    "cf_chl_opt",
    "just a moment...",
    "ddos-guard",
    "checking your browser before accessing",
];

/// Statuses an anti-bot interstitial is served with.
const CHALLENGE_STATUSES: &[u16] = &[403, 429, 503];

/// Whole-page titles of anti-bot interstitials.
const CHALLENGE_TITLES: &[&str] = &[
    "just a moment...",
    "attention required! | cloudflare",
    "ddos-guard",
    "checking your browser...",
];

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<title\b[^>]*>(.*?)</title>"));

/// Titles that carry no information about the item.
const PLACEHOLDER_TITLES: &[&str] = &["unknown", "anna's archive", "anna’s archive"];

/// Extensions that mark an anchor as a direct file link on a mirror page.
const BOOK_EXTENSIONS: &[&str] = &[".epub", ".pdf", ".mobi", ".azw3", ".cbr", ".cbz", ".djvu"];

/// One `<a>` element: decoded `href` plus its visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub href: String,
    pub text: String,
}

/// Returns every anchor with an `href`, in document order.
#[must_use]
pub fn extract_anchors(html: &str) -> Vec<Anchor> {
    ANCHOR_RE
        .captures_iter(html)
        .filter_map(|caps| {
            let attrs = caps.get(1)?.as_str();
            let href_caps = HREF_RE.captures(attrs)?;
            let raw = href_caps
                .get(1)
                .or_else(|| href_caps.get(2))
                .or_else(|| href_caps.get(3))?
                .as_str();
            let text = caps.get(2).map_or("", |m| m.as_str());
            Some(Anchor {
                href: decode_entities(raw.trim()),
                text: collapse_whitespace(&decode_entities(&TAG_RE.replace_all(text, " "))),
            })
        })
        .collect()
}

/// Resolves a possibly relative link against `base`.
///
/// Handles absolute, scheme-relative (`//host/path`), root-relative, and
/// path-relative links. Returns `None` for fragments, non-HTTP schemes, and
/// anything that does not join to an `http`/`https` URL.
#[must_use]
pub fn absolutize_url(value: &str, base: &Url) -> Option<Url> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('#') {
        return None;
    }
    let mut joined = base.join(value).ok()?;
    if !matches!(joined.scheme(), "http" | "https") || joined.host_str().is_none() {
        return None;
    }
    joined.set_fragment(None);
    Some(joined)
}

/// Extracts mirror links from a source page.
///
/// Keeps anchors whose `href` contains any of `patterns`, absolutizes them
/// against `base`, and drops duplicates while preserving discovery order.
#[must_use]
pub fn extract_mirror_links(html: &str, base: &Url, patterns: &[String]) -> Vec<Url> {
    let patterns: Vec<String> = patterns
        .iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in extract_anchors(html) {
        let href_lower = anchor.href.to_ascii_lowercase();
        if !patterns.iter().any(|p| href_lower.contains(p.as_str())) {
            continue;
        }
        let Some(url) = absolutize_url(&anchor.href, base) else {
            continue;
        };
        if seen.insert(url.as_str().to_string()) {
            links.push(url);
        }
    }
    links
}

/// Extracts the item title: the first `text-3xl` element, else the first `<h1>`.
#[must_use]
pub fn extract_title(html: &str) -> Option<String> {
    [&*TEXT_3XL_RE, &*H1_RE].into_iter().find_map(|re| {
        let inner = re.captures(html)?.get(1)?.as_str();
        let text = collapse_whitespace(&decode_entities(&TAG_RE.replace_all(inner, " ")));
        usable_title(&text).then_some(text)
    })
}

/// True when `title` is non-empty and not a placeholder.
#[must_use]
pub fn usable_title(title: &str) -> bool {
    let lowered = title.trim().to_lowercase();
    !lowered.is_empty() && !PLACEHOLDER_TITLES.contains(&lowered.as_str())
}

/// True when the body carries an anti-bot challenge marker.
#[must_use]
pub fn is_challenge_body(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lowered.contains(m))
}

/// True when a response is an anti-bot interstitial rather than content.
///
/// Markers only count on a blocking status (403, 429, 503). A page titled
/// exactly like an interstitial counts on any status.
#[must_use]
pub fn is_challenge_page(status: u16, body: &str) -> bool {
    if CHALLENGE_STATUSES.contains(&status) && is_challenge_body(body) {
        return true;
    }
    TITLE_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .is_some_and(|title| {
            let title = title.as_str().trim().to_ascii_lowercase();
            CHALLENGE_TITLES.contains(&title.as_str())
        })
}

/// Finds the direct file link on a mirror page.
///
/// Preference order: a `get.php`/`main.php` link, then an anchor whose text
/// says "download" and which does not point at `file.php`, then any anchor
/// pointing at a known book extension.
#[must_use]
pub fn find_direct_link(html: &str, base: &Url) -> Option<Url> {
    let anchors = extract_anchors(html);
    let pick = |pred: &dyn Fn(&Anchor) -> bool| {
        anchors
            .iter()
            .filter(|a| pred(a))
            .find_map(|a| absolutize_url(&a.href, base))
    };

    pick(&|a| {
        let href = a.href.to_ascii_lowercase();
        href.contains("get.php") || href.contains("main.php")
    })
    .or_else(|| {
        pick(&|a| {
            a.text.to_lowercase().contains("download")
                && !a.href.to_ascii_lowercase().contains("file.php")
        })
    })
    .or_else(|| {
        pick(&|a| {
            let href = a.href.to_ascii_lowercase();
            let path = href.split(['?', '#']).next().unwrap_or("");
            BOOK_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        })
    })
}

/// Moves mirrors whose host contains `preferred` to the front, keeping relative order.
#[must_use]
pub fn prioritize_preferred(links: Vec<Url>, preferred: Option<&str>) -> Vec<Url> {
    let Some(preferred) = preferred.map(str::trim).filter(|p| !p.is_empty()) else {
        return links;
    };
    let preferred = preferred.to_ascii_lowercase();
    let (mut first, rest): (Vec<Url>, Vec<Url>) = links.into_iter().partition(|url| {
        url.host_str()
            .is_some_and(|host| host.to_ascii_lowercase().contains(&preferred))
    });
    first.extend(rest);
    first
}

/// True for HTML/XHTML content types.
#[must_use]
pub fn is_html_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime == "text/html" || mime == "application/xhtml+xml"
}

/// True for content types worth reading as text.
#[must_use]
pub fn is_textual_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.starts_with("text/")
        || matches!(
            mime.as_str(),
            "application/xhtml+xml" | "application/json" | "application/xml"
        )
}

/// Decodes the named entities that show up in `href`s and titles, plus numeric ones.
#[must_use]
pub fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    let numeric = NUMERIC_ENTITY_RE.replace_all(value, |caps: &regex::Captures<'_>| {
        let code = caps
            .get(1)
            .and_then(|hex| u32::from_str_radix(hex.as_str(), 16).ok())
            .or_else(|| caps.get(2).and_then(|dec| dec.as_str().parse().ok()));
        code.and_then(char::from_u32)
            .map_or_else(|| caps[0].to_string(), |c| c.to_string())
    });
    numeric
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
