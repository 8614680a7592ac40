//! XML / HTML helpers for ad markup: VAST documents, SOAP-like envelopes
//! and `<meta>` tags carrying escaped VAST.

use std::sync::LazyLock;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use regex::Regex;

/// VAST elements whose text is a URL.
pub const VAST_URL_TAGS: &[&str] = &[
    "Impression",
    "ClickThrough",
    "ClickTracking",
    "MediaFile",
    "Tracking",
];

static CDATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!\[CDATA\[(.*?)\]\]>").expect("static regex"));
static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("static regex"));
static ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("static regex")
});

struct Frame {
    name: String,
    text: String,
    had_child: bool,
}

/// Walk a well-formed XML document, calling `on_close(local_name, text)`
/// for every element as it closes.  `text` is the trimmed character data
/// before the element's first child (CDATA included).
///
/// Returns `None` if the document is malformed: bad nesting, undefined
/// entities, unclosed elements, stray top-level text or several roots.
fn walk_elements(xml: &str, mut on_close: impl FnMut(&str, &str)) -> Option<()> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<Frame> = Vec::new();
    let mut roots = 0usize;

    loop {
        match reader.read_event().ok()? {
            Event::Start(e) => {
                match stack.last_mut() {
                    Some(parent) => parent.had_child = true,
                    None => roots += 1,
                }
                stack.push(Frame {
                    name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                    text: String::new(),
                    had_child: false,
                });
            }
            Event::Empty(e) => {
                match stack.last_mut() {
                    Some(parent) => parent.had_child = true,
                    None => roots += 1,
                }
                on_close(&String::from_utf8_lossy(e.local_name().as_ref()), "");
            }
            Event::Text(t) => {
                let text = t.unescape().ok()?;
                match stack.last_mut() {
                    Some(top) if !top.had_child => top.text.push_str(&text),
                    Some(_) => {}
                    None if text.trim().is_empty() => {}
                    None => return None,
                }
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c).into_owned();
                match stack.last_mut() {
                    Some(top) if !top.had_child => top.text.push_str(&text),
                    Some(_) => {}
                    None => return None,
                }
            }
            Event::End(_) => {
                let frame = stack.pop()?;
                on_close(&frame.name, frame.text.trim());
            }
            Event::Eof => break,
            _ => {}
        }
        if roots > 1 {
            return None;
        }
    }
    (stack.is_empty() && roots == 1).then_some(())
}

/// URLs held in VAST elements, or `None` if `xml` is not well-formed.
pub fn vast_urls(xml: &str) -> Option<Vec<String>> {
    let mut urls = Vec::new();
    walk_elements(xml, |name, text| {
        if !text.is_empty() && VAST_URL_TAGS.contains(&name) {
            urls.push(text.to_string());
        }
    })?;
    Some(urls)
}

/// Like [`vast_urls`], retrying once on the HTML-entity-unescaped text.
pub fn vast_urls_lenient(xml: &str) -> Option<Vec<String>> {
    vast_urls(xml).or_else(|| vast_urls(&html_escape::decode_html_entities(xml)))
}

/// Text of the first element named `local_name` (namespace prefix ignored).
pub fn element_text(xml: &str, local_name: &str) -> Option<String> {
    let mut found: Option<String> = None;
    walk_elements(xml, |name, text| {
        if found.is_none() && name == local_name {
            found = Some(text.to_string());
        }
    })?;
    found
}

/// Contents of every `<![CDATA[...]]>` section.
pub fn cdata_sections(text: &str) -> Vec<String> {
    CDATA
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Unescaped `content` attribute of the first `<meta name="...">` tag.
pub fn meta_content(html: &str, name: &str) -> Option<String> {
    META_TAG.find_iter(html).find_map(|tag| {
        let mut tag_name = None;
        let mut content = None;
        for cap in ATTR.captures_iter(tag.as_str()) {
            let value = cap.get(2).or_else(|| cap.get(3)).map_or("", |m| m.as_str());
            match cap[1].to_ascii_lowercase().as_str() {
                "name" => tag_name = Some(value.to_string()),
                "content" => content = Some(value.to_string()),
                _ => {}
            }
        }
        if tag_name.as_deref() == Some(name) {
            content.map(|c| html_escape::decode_html_entities(&c).into_owned())
        } else {
            None
        }
    })
}
