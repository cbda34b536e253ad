//! Synthetic challenge page served in place of the target URL

const CHALLENGE_TEMPLATE: &str = include_str!("../assets/challenge.html");
const INDEX_PAGE: &str = include_str!("../assets/index.html");

/// Marker in the template replaced by the widget container
pub const WIDGET_PLACEHOLDER: &str = "<!-- cf turnstile -->";
/// Hidden input the widget fills with its token
pub const RESPONSE_FIELD: &str = "[name=cf-turnstile-response]";
pub const WIDGET_SELECTOR: &str = ".cf-turnstile";
/// Global set by the page's success callback
pub const WINDOW_TOKEN: &str = "window.turnstileToken";

/// Widget container with its data attributes. Empty `action` and `cdata`
/// are left out.
pub fn widget_markup(sitekey: &str, action: Option<&str>, cdata: Option<&str>) -> String {
    let mut div = format!(
        r#"<div class="cf-turnstile" data-sitekey="{}" data-callback="onCaptchaSuccess""#,
        escape_attr(sitekey)
    );
    if let Some(action) = action.filter(|a| !a.is_empty()) {
        div.push_str(&format!(r#" data-action="{}""#, escape_attr(action)));
    }
    if let Some(cdata) = cdata.filter(|c| !c.is_empty()) {
        div.push_str(&format!(r#" data-cdata="{}""#, escape_attr(cdata)));
    }
    div.push_str("></div>");
    div
}

pub fn build_challenge_page(sitekey: &str, action: Option<&str>, cdata: Option<&str>) -> String {
    CHALLENGE_TEMPLATE.replacen(WIDGET_PLACEHOLDER, &widget_markup(sitekey, action, cdata), 1)
}

/// The URL the page is routed under, always ending in `/`
pub fn target_url_with_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

pub fn index_page() -> &'static str {
    INDEX_PAGE
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
