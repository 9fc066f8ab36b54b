//! Control lookup across nested frames.
//!
//! The portal injects its download dialog as an iframe inside a modal, so a
//! plain `querySelector` on the top document never sees the real button.
//! Lookups here walk the top document and every reachable `iframe`/`frame`
//! recursively (bounded by a depth limit) and report where the control was
//! found as a frame path that a later click can resolve again.

use serde::{Deserialize, Serialize};

/// Elements considered when matching a locator by visible text.
const TEXT_CANDIDATES: &str =
    "a, button, input[type=\"button\"], input[type=\"submit\"], [role=\"button\"], [role=\"menuitem\"], li";

/// How to recognise one control on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlLocator {
    /// Human-readable name used in logs and errors.
    pub name: String,
    /// CSS selectors, tried in order.
    #[serde(default)]
    pub selectors: Vec<String>,
    /// Case-insensitive substrings matched against text or `value`.
    #[serde(default)]
    pub texts: Vec<String>,
    /// Skip elements that are present but hidden.
    #[serde(default = "default_true")]
    pub require_visible: bool,
}

fn default_true() -> bool {
    true
}

impl ControlLocator {
    pub fn new(name: &str, selectors: &[&str], texts: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            texts: texts.iter().map(|s| s.to_string()).collect(),
            require_visible: true,
        }
    }
}

/// Where a control was found: frame indices from the top document down,
/// then the selector and match index inside that frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHandle {
    pub locator: String,
    pub frame_path: Vec<usize>,
    pub selector: String,
    pub index: usize,
}

#[derive(Deserialize)]
struct ProbeHit {
    path: Vec<usize>,
    selector: String,
    index: usize,
}

/// Script that searches all frames for `locator` and returns
/// `{path, selector, index}` or `null`.
///
/// Every selector is tried in every frame before any text needle.
pub fn probe_script(locator: &ControlLocator, max_depth: usize) -> String {
    let spec = serde_json::json!({
        "selectors": locator.selectors,
        "texts": locator.texts.iter().map(|t| t.to_lowercase()).collect::<Vec<_>>(),
        "requireVisible": locator.require_visible,
        "maxDepth": max_depth,
        "textCandidates": TEXT_CANDIDATES,
    });

    format!(
        r#"
        (() => {{
            const spec = {spec};
            const visible = (el) => {{
                if (!spec.requireVisible) return true;
                const view = el.ownerDocument.defaultView;
                const style = view ? view.getComputedStyle(el) : null;
                if (style && (style.display === 'none' || style.visibility === 'hidden')) return false;
                const rect = el.getBoundingClientRect();
                return rect.width > 0 || rect.height > 0;
            }};
            const textOf = (el) =>
                ((el.value || '') + ' ' + (el.innerText || el.textContent || '')).toLowerCase();
            const frames = [];
            const collect = (doc, path, depth) => {{
                frames.push({{ doc: doc, path: path }});
                if (depth >= spec.maxDepth) return;
                const children = doc.querySelectorAll('iframe, frame');
                for (let i = 0; i < children.length; i++) {{
                    let child = null;
                    try {{ child = children[i].contentDocument; }} catch (e) {{ child = null; }}
                    if (child) collect(child, path.concat([i]), depth + 1);
                }}
            }};
            collect(document, [], 0);
            const bySelector = () => {{
                for (const sel of spec.selectors) {{
                    for (const f of frames) {{
                        let nodes;
                        try {{ nodes = f.doc.querySelectorAll(sel); }} catch (e) {{ break; }}
                        for (let i = 0; i < nodes.length; i++) {{
                            if (visible(nodes[i])) return {{ path: f.path, selector: sel, index: i }};
                        }}
                    }}
                }}
                return null;
            }};
            const byText = () => {{
                if (spec.texts.length === 0) return null;
                for (const f of frames) {{
                    const nodes = f.doc.querySelectorAll(spec.textCandidates);
                    for (let i = 0; i < nodes.length; i++) {{
                        const text = textOf(nodes[i]);
                        if (spec.texts.some((t) => text.includes(t)) && visible(nodes[i])) {{
                            return {{ path: f.path, selector: spec.textCandidates, index: i }};
                        }}
                    }}
                }}
                return null;
            }};
            return bySelector() || byText();
        }})()
        "#
    )
}

/// Script that resolves `handle` again, hovers it and clicks it.
/// Returns `true` if the element was still there.
pub fn click_script(handle: &ControlHandle) -> String {
    let spec = serde_json::json!({
        "path": handle.frame_path,
        "selector": handle.selector,
        "index": handle.index,
    });

    format!(
        r#"
        (() => {{
            const spec = {spec};
            let doc = document;
            for (const i of spec.path) {{
                const frame = doc.querySelectorAll('iframe, frame')[i];
                if (!frame) return false;
                try {{ doc = frame.contentDocument; }} catch (e) {{ return false; }}
                if (!doc) return false;
            }}
            const el = doc.querySelectorAll(spec.selector)[spec.index];
            if (!el) return false;
            const view = doc.defaultView || window;
            for (const type of ['mouseover', 'mouseenter', 'mousemove']) {{
                el.dispatchEvent(new view.MouseEvent(type, {{ bubbles: true, cancelable: true }}));
            }}
            el.click();
            return true;
        }})()
        "#
    )
}

/// Turn the probe script's return value into a handle.
pub fn parse_probe_result(
    locator: &ControlLocator,
    value: serde_json::Value,
) -> Option<ControlHandle> {
    if value.is_null() {
        return None;
    }
    let hit: ProbeHit = serde_json::from_value(value).ok()?;
    Some(ControlHandle {
        locator: locator.name.clone(),
        frame_path: hit.path,
        selector: hit.selector,
        index: hit.index,
    })
}
