//! MIME rendering of evaluation results.
//!
//! The default policy builds a bundle from a value's `Renderable` hooks and
//! always adds a `text/plain` fallback from the inspector. A host may install
//! a `Renderer` override; when it fails, the default policy is used instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use kernel_wire::{
    encode_base64, ErrorInfo, MimeBundle, APPLICATION_JSON, IMAGE_JPEG, IMAGE_PNG, IMAGE_SVG,
    TEXT_HTML, TEXT_PLAIN,
};
use log::{debug, warn};

use crate::inspect::{inspect, to_display_string};
use crate::reflect::type_of;
use crate::value::{HookError, HookResult, Renderable, Value};

/// Replaces the default rendering policy.
pub trait Renderer: Send + Sync {
    fn render(&self, value: &Value) -> Result<MimeBundle, HookError>;
}

impl<F> Renderer for F
where
    F: Fn(&Value) -> Result<MimeBundle, HookError> + Send + Sync,
{
    fn render(&self, value: &Value) -> Result<MimeBundle, HookError> {
        self(value)
    }
}

/// Renders values into MIME bundles, honouring an optional override.
#[derive(Default)]
pub struct MimeRenderer {
    custom: RwLock<Option<Arc<dyn Renderer>>>,
}

impl MimeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or with `None`, remove) the override.
    pub fn set_renderer(&self, renderer: Option<Arc<dyn Renderer>>) {
        match self.custom.write() {
            Ok(mut guard) => *guard = renderer,
            Err(poisoned) => *poisoned.into_inner() = renderer,
        }
    }

    pub fn has_override(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<dyn Renderer>> {
        match self.custom.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Render a value. Never fails: the inspector is the last resort.
    ///
    /// `undefined` and `null` have fixed bundles that no override replaces.
    pub fn render(&self, value: &Value) -> MimeBundle {
        match value {
            Value::Undefined => return MimeBundle::single(TEXT_PLAIN, "undefined"),
            Value::Null => return MimeBundle::single(TEXT_PLAIN, "null"),
            _ => {}
        }
        if let Some(renderer) = self.current() {
            match catch_unwind(AssertUnwindSafe(|| renderer.render(value))) {
                Ok(Ok(mut bundle)) => {
                    if !bundle.contains(TEXT_PLAIN) {
                        bundle.insert(TEXT_PLAIN, inspect(value));
                    }
                    return bundle;
                }
                Ok(Err(e)) => warn!("[render] custom renderer failed, using default: {}", e),
                Err(_) => warn!("[render] custom renderer panicked, using default"),
            }
        }
        default_render(value)
    }

    /// Bundle for an explicit output call such as `$$.html(value)`.
    pub fn format(&self, format: Format, value: &Value) -> MimeBundle {
        match format {
            Format::Mime => match value {
                Value::Object(obj) => obj
                    .entries
                    .iter()
                    .map(|(mime_type, v)| {
                        let rendered = match v {
                            Value::String(s) => serde_json::Value::String(s.clone()),
                            other => other.to_json(),
                        };
                        (mime_type.clone(), rendered)
                    })
                    .collect(),
                other => self.render(other),
            },
            Format::Text => MimeBundle::single(TEXT_PLAIN, to_display_string(value)),
            Format::Html => MimeBundle::single(TEXT_HTML, to_display_string(value)),
            Format::Svg => MimeBundle::single(IMAGE_SVG, to_display_string(value)),
            Format::Png => MimeBundle::single(IMAGE_PNG, image_data(value)),
            Format::Jpeg => MimeBundle::single(IMAGE_JPEG, image_data(value)),
            Format::Json => MimeBundle::single(APPLICATION_JSON, value.to_json()),
        }
    }
}

/// Explicit output formats exposed to evaluated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Mime,
    Text,
    Html,
    Svg,
    Png,
    Jpeg,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Format::Mime => "mime",
            Format::Text => "text",
            Format::Html => "html",
            Format::Svg => "svg",
            Format::Png => "png",
            Format::Jpeg => "jpeg",
            Format::Json => "json",
        };
        f.write_str(name)
    }
}

/// Image payloads are base64 on the wire. Raw bytes are encoded here; any
/// other value is assumed to already be base64 text.
fn image_data(value: &Value) -> String {
    match value {
        Value::Bytes(bytes) => encode_base64(bytes),
        other => to_display_string(other),
    }
}

/// Run one hook, isolating errors and panics.
fn call_hook<T>(
    custom: &dyn Renderable,
    hook: &str,
    f: impl FnOnce(&dyn Renderable) -> HookResult<T>,
) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(|| f(custom))) {
        Ok(None) => None,
        Ok(Some(Ok(out))) => Some(out),
        Ok(Some(Err(e))) => {
            warn!("[render] {}.{} failed: {}", custom.type_name(), hook, e);
            None
        }
        Err(_) => {
            warn!("[render] {}.{} panicked", custom.type_name(), hook);
            None
        }
    }
}

/// The default policy: hooks first, earlier hooks win, then `text/plain`.
pub fn default_render(value: &Value) -> MimeBundle {
    let mut bundle = MimeBundle::new();

    if let Value::Custom(custom) = value {
        let custom: &dyn Renderable = &**custom;
        if let Some(mime) = call_hook(custom, "toMime", |c| c.to_mime()) {
            bundle.merge_absent(mime);
        }
        if let Some(html) = call_hook(custom, "toHtml", |c| c.to_html()) {
            bundle.insert_if_absent(TEXT_HTML, html);
        }
        if let Some(svg) = call_hook(custom, "toSvg", |c| c.to_svg()) {
            bundle.insert_if_absent(IMAGE_SVG, svg);
        }
        if let Some(png) = call_hook(custom, "toPng", |c| c.to_png()) {
            bundle.insert_if_absent(IMAGE_PNG, encode_base64(&png));
        }
        if let Some(jpeg) = call_hook(custom, "toJpeg", |c| c.to_jpeg()) {
            bundle.insert_if_absent(IMAGE_JPEG, encode_base64(&jpeg));
        }
    }

    if !bundle.contains(TEXT_PLAIN) {
        let text = match catch_unwind(AssertUnwindSafe(|| inspect(value))) {
            Ok(text) => text,
            Err(_) => {
                debug!("[render] inspector panicked, falling back to type name");
                format!("[{}]", type_of(value))
            }
        };
        bundle.insert(TEXT_PLAIN, text);
    }
    bundle
}

/// Structured error payload for a thrown or rejected value.
pub fn error_info(value: &Value) -> ErrorInfo {
    match value {
        Value::Error(err) => ErrorInfo {
            ename: err.name.clone(),
            evalue: err.message.clone(),
            traceback: err.traceback(),
        },
        Value::Object(obj) if obj.get("name").is_some() || obj.get("message").is_some() => {
            let field = |key: &str| obj.get(key).map(to_display_string).unwrap_or_default();
            let traceback = match obj.get("stack") {
                Some(Value::String(stack)) => stack.lines().map(str::to_string).collect(),
                _ => Vec::new(),
            };
            ErrorInfo {
                ename: field("name"),
                evalue: field("message"),
                traceback,
            }
        }
        other => ErrorInfo {
            ename: type_of(other).to_string(),
            evalue: to_display_string(other),
            traceback: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Object;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn test_render_nullish() {
        let renderer = MimeRenderer::new();
        assert_eq!(
            serde_json::to_value(renderer.render(&Value::Undefined)).unwrap(),
            json!({"text/plain": "undefined"})
        );
        assert_eq!(
            serde_json::to_value(renderer.render(&Value::Null)).unwrap(),
            json!({"text/plain": "null"})
        );
    }

    #[test]
    fn test_render_number_and_string() {
        let renderer = MimeRenderer::new();
        assert_eq!(renderer.render(&Value::Number(2.0)).text(TEXT_PLAIN), Some("2"));
        assert_eq!(renderer.render(&Value::from("hi")).text(TEXT_PLAIN), Some("'hi'"));
    }

    #[derive(Debug)]
    struct Chart;

    impl Renderable for Chart {
        fn type_name(&self) -> &str {
            "Chart"
        }

        fn to_mime(&self) -> HookResult<MimeBundle> {
            Some(Ok(MimeBundle::single(TEXT_HTML, "<b>from mime</b>")))
        }

        fn to_html(&self) -> HookResult<String> {
            Some(Ok("<i>from html</i>".to_string()))
        }

        fn to_png(&self) -> HookResult<Bytes> {
            Some(Ok(Bytes::from_static(b"png")))
        }
    }

    #[test]
    fn test_hooks_merge_without_overwriting() {
        let bundle = default_render(&Value::custom(Chart));
        assert_eq!(bundle.text(TEXT_HTML), Some("<b>from mime</b>"));
        assert_eq!(bundle.text(IMAGE_PNG), Some("cG5n"));
        assert_eq!(bundle.text(TEXT_PLAIN), Some("Chart {}"));
    }

    #[derive(Debug)]
    struct Broken;

    impl Renderable for Broken {
        fn type_name(&self) -> &str {
            "Broken"
        }

        fn to_mime(&self) -> HookResult<MimeBundle> {
            panic!("hook exploded");
        }

        fn to_html(&self) -> HookResult<String> {
            Some(Err(HookError("no html".into())))
        }

        fn to_svg(&self) -> HookResult<String> {
            Some(Ok("<svg/>".into()))
        }
    }

    #[test]
    fn test_failing_hooks_are_skipped() {
        let bundle = default_render(&Value::custom(Broken));
        assert!(bundle.contains(TEXT_PLAIN));
        assert!(!bundle.contains(TEXT_HTML));
        assert_eq!(bundle.text(IMAGE_SVG), Some("<svg/>"));
    }

    #[test]
    fn test_override_and_fallback() {
        let renderer = MimeRenderer::new();
        let html: Arc<dyn Renderer> =
            Arc::new(|_: &Value| -> Result<MimeBundle, HookError> {
                Ok(MimeBundle::single(TEXT_HTML, "<p>custom</p>"))
            });
        renderer.set_renderer(Some(html));
        assert!(renderer.has_override());
        let bundle = renderer.render(&Value::Number(1.0));
        assert_eq!(bundle.text(TEXT_HTML), Some("<p>custom</p>"));
        assert_eq!(bundle.text(TEXT_PLAIN), Some("1"));

        let failing: Arc<dyn Renderer> =
            Arc::new(|_: &Value| -> Result<MimeBundle, HookError> {
                Err(HookError("nope".into()))
            });
        renderer.set_renderer(Some(failing));
        let bundle = renderer.render(&Value::Number(1.0));
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.text(TEXT_PLAIN), Some("1"));
    }

    #[test]
    fn test_override_does_not_touch_nullish() {
        let renderer = MimeRenderer::new();
        let loud: Arc<dyn Renderer> =
            Arc::new(|_: &Value| -> Result<MimeBundle, HookError> {
                Ok(MimeBundle::single(TEXT_PLAIN, "overridden"))
            });
        renderer.set_renderer(Some(loud));

        assert_eq!(
            serde_json::to_value(renderer.render(&Value::Undefined)).unwrap(),
            json!({"text/plain": "undefined"})
        );
        assert_eq!(
            serde_json::to_value(renderer.render(&Value::Null)).unwrap(),
            json!({"text/plain": "null"})
        );
        assert_eq!(
            renderer.render(&Value::Bool(true)).text(TEXT_PLAIN),
            Some("overridden")
        );
    }

    #[test]
    fn test_explicit_formats() {
        let renderer = MimeRenderer::new();
        assert_eq!(
            renderer.format(Format::Html, &Value::from("<b>x</b>")).text(TEXT_HTML),
            Some("<b>x</b>")
        );
        assert_eq!(
            renderer
                .format(Format::Png, &Value::Bytes(Bytes::from_static(b"png")))
                .text(IMAGE_PNG),
            Some("cG5n")
        );

        let mut obj = Object::new();
        obj.insert("a", Value::Number(1.0));
        let json = renderer.format(Format::Json, &Value::Object(obj.clone()));
        assert_eq!(json.get(APPLICATION_JSON), Some(&json!({"a": 1})));

        let mut mime = Object::new();
        mime.insert("text/markdown", Value::from("# hi"));
        mime.insert("application/json", Value::Object(obj));
        let bundle = renderer.format(Format::Mime, &Value::Object(mime));
        assert_eq!(bundle.text("text/markdown"), Some("# hi"));
        assert_eq!(bundle.get(APPLICATION_JSON), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_error_info_shapes() {
        let info = error_info(&Value::error("TypeError", "bad"));
        assert_eq!(info.ename, "TypeError");
        assert_eq!(info.evalue, "bad");
        assert_eq!(info.traceback[0], "TypeError: bad");

        let info = error_info(&Value::from("plain"));
        assert_eq!(info.ename, "string");
        assert_eq!(info.evalue, "plain");
        assert!(info.traceback.is_empty());

        let mut obj = Object::new();
        obj.insert("name", Value::from("Custom"));
        obj.insert("message", Value::from("oops"));
        let info = error_info(&Value::Object(obj));
        assert_eq!((info.ename.as_str(), info.evalue.as_str()), ("Custom", "oops"));
    }
}
