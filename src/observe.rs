//! Page observation — enumerates interactive elements and packages the
//! state the model sees each turn: URL, title, and a compact element list.

use std::fmt;

use eoka::Page;
use serde::Deserialize;

use crate::{Error, Result};

/// An interactive element, addressable by index until the next observation.
#[derive(Debug, Clone)]
pub struct PageElement {
    /// Zero-based index into the current observation.
    pub index: usize,
    /// HTML tag name (e.g. "button", "input", "a").
    pub tag: String,
    /// Visible text or accessible label, truncated.
    pub text: String,
    /// Placeholder attribute for inputs.
    pub placeholder: Option<String>,
    /// Input type for `<input>`/`<select>` elements.
    pub input_type: Option<String>,
    /// Unique CSS selector used to act on the element.
    pub selector: String,
}

impl fmt::Display for PageElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] <{}", self.index, self.tag)?;
        if let Some(ref t) = self.input_type {
            if t != "text" {
                write!(f, " type=\"{}\"", t)?;
            }
        }
        f.write_str(">")?;
        if !self.text.is_empty() {
            write!(f, " \"{}\"", self.text)?;
        }
        if let Some(ref p) = self.placeholder {
            write!(f, " placeholder=\"{}\"", p)?;
        }
        Ok(())
    }
}

/// What the model sees before deciding on an action.
#[derive(Debug, Clone, Default)]
pub struct PageView {
    pub url: String,
    pub title: String,
    pub elements: Vec<PageElement>,
}

impl PageView {
    /// Compact text list for LLM consumption, one element per line.
    pub fn element_list(&self) -> String {
        let mut out = String::with_capacity(self.elements.len() * 40);
        for el in &self.elements {
            out.push_str(&el.to_string());
            out.push('\n');
        }
        out
    }

    /// One-line summary recorded in the step transcript.
    pub fn summary(&self) -> String {
        format!(
            "{} — \"{}\" — {} interactive elements",
            self.url,
            self.title,
            self.elements.len()
        )
    }
}

#[derive(Deserialize)]
struct RawElement {
    tag: String,
    text: String,
    placeholder: Option<String>,
    input_type: Option<String>,
    selector: String,
}

/// Enumerates visible interactive elements with stable selectors.
const ENUMERATE_JS: &str = r#"
(() => {
    const INTERACTIVE = 'a, button, input, select, textarea, [role="button"], [role="link"], [role="tab"], [onclick], [contenteditable="true"]';
    const results = [];
    const seen = new Set();

    function labelFor(el) {
        if (el.id) {
            const label = document.querySelector('label[for=' + JSON.stringify(el.id) + ']');
            if (label) return label.textContent.trim();
        }
        const wrap = el.closest('label');
        if (wrap) {
            const clone = wrap.cloneNode(true);
            clone.querySelectorAll('input, select, textarea').forEach(c => c.remove());
            return clone.textContent.trim();
        }
        return '';
    }

    function selectorFor(el, tag) {
        if (el.id) return '#' + CSS.escape(el.id);
        if (el.name) return tag + '[name=' + JSON.stringify(el.name) + ']';
        const aria = el.getAttribute('aria-label');
        if (aria) return tag + '[aria-label=' + JSON.stringify(aria) + ']';
        const testid = el.getAttribute('data-testid');
        if (testid) return '[data-testid=' + JSON.stringify(testid) + ']';
        const parts = [];
        let node = el;
        while (node && node !== document.body && parts.length < 4) {
            let s = node.tagName.toLowerCase();
            if (node.id) { parts.unshift('#' + CSS.escape(node.id)); break; }
            const parent = node.parentElement;
            if (parent) {
                const siblings = Array.from(parent.children).filter(c => c.tagName === node.tagName);
                if (siblings.length > 1) s += ':nth-of-type(' + (siblings.indexOf(node) + 1) + ')';
            }
            parts.unshift(s);
            node = parent;
        }
        return parts.join(' > ');
    }

    for (const el of document.querySelectorAll(INTERACTIVE)) {
        const rect = el.getBoundingClientRect();
        if (rect.width < 2 || rect.height < 2) continue;
        const style = getComputedStyle(el);
        if (style.display === 'none' || style.visibility === 'hidden' || parseFloat(style.opacity) < 0.1) continue;
        if (typeof __errand_viewport_only !== 'undefined' && __errand_viewport_only) {
            if (rect.bottom < 0 || rect.top > window.innerHeight) continue;
            if (rect.right < 0 || rect.left > window.innerWidth) continue;
        }

        const tag = el.tagName.toLowerCase();
        const isFormEl = tag === 'input' || tag === 'select' || tag === 'textarea';
        let text = el.getAttribute('aria-label') || '';
        if (!text) {
            if (isFormEl) {
                text = labelFor(el);
            } else {
                text = (el.textContent || '').trim().replace(/\s+/g, ' ');
            }
        }
        if (text.length > 60) text = text.substring(0, 57) + '...';

        const placeholder = el.getAttribute('placeholder') || '';
        if (!text && !placeholder && !isFormEl) continue;

        const selector = selectorFor(el, tag);
        if (seen.has(selector)) continue;
        seen.add(selector);

        results.push({
            tag,
            text,
            placeholder: placeholder || null,
            input_type: tag === 'input'
                ? (el.getAttribute('type') || 'text')
                : (tag === 'select' ? 'select' : null),
            selector,
        });
    }

    return JSON.stringify(results);
})()
"#;

/// Run the enumeration script and return parsed elements.
pub async fn enumerate(page: &Page, viewport_only: bool) -> Result<Vec<PageElement>> {
    let js = format!(
        "var __errand_viewport_only = {}; {}",
        viewport_only, ENUMERATE_JS
    );
    let json_str: String = page.evaluate(&js).await?;

    let raw: Vec<RawElement> = serde_json::from_str(&json_str)
        .map_err(|e| Error::Action(format!("element enumeration parse error: {}", e)))?;

    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, r)| PageElement {
            index: i,
            tag: r.tag,
            text: r.text,
            placeholder: r.placeholder,
            input_type: r.input_type,
            selector: r.selector,
        })
        .collect())
}
