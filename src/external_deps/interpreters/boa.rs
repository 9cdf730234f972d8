use boa_engine::{Context, JsValue, Source};
use url::Url;

use super::{InterpreterError, InterpreterResult, JavascriptInterpreter};

const LOOP_ITERATION_LIMIT: u64 = 1_000_000;
const RECURSION_LIMIT: usize = 512;

/// Default interpreter backed by the Boa JavaScript engine.
#[derive(Debug, Default)]
pub struct BoaJavascriptInterpreter;

impl BoaJavascriptInterpreter {
    pub fn new() -> Self {
        Self
    }

    fn build_prelude(&self, page_url: &Url) -> String {
        let href = escape_js(page_url.as_str());
        let host = escape_js(page_url.host_str().unwrap_or_default());
        let origin = escape_js(&page_url.origin().ascii_serialization());
        let protocol = escape_js(&format!("{}:", page_url.scheme()));
        let pathname = escape_js(page_url.path());
        format!(
            r#"
var __redirect = null;
function __go(target) {{
    if (__redirect === null && target !== undefined && target !== null && String(target) !== "") {{
        __redirect = String(target);
    }}
}}
var location = {{
    hostname: "{host}",
    host: "{host}",
    origin: "{origin}",
    protocol: "{protocol}",
    pathname: "{pathname}",
    search: "",
    hash: "",
    port: "",
    replace: function(target) {{ __go(target); }},
    assign: function(target) {{ __go(target); }},
    reload: function() {{}},
    toString: function() {{ return this.href; }}
}};
Object.defineProperty(location, "href", {{
    get: function() {{ return __redirect === null ? "{href}" : __redirect; }},
    set: function(target) {{ __go(target); }}
}});
var window = {{}};
Object.defineProperty(window, "location", {{
    get: function() {{ return location; }},
    set: function(target) {{ __go(target); }}
}});
window.open = function(target) {{ __go(target); return window; }};
window.addEventListener = function(name, cb) {{ if (typeof cb === "function" && (name === "load" || name === "DOMContentLoaded")) {{ cb(); }} }};
var self = window;
var top = window;
var navigator = {{
    userAgent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
    language: "en-US",
    languages: ["en-US", "en"],
    platform: "Win32",
    webdriver: false
}};
window.navigator = navigator;
function __makeElement(tag) {{
    var element = {{
        tagName: String(tag).toUpperCase(),
        style: {{}},
        attributes: {{}},
        children: [],
        addEventListener: function() {{}},
        removeEventListener: function() {{}},
        appendChild: function(child) {{ this.children.push(child); return child; }},
        setAttribute: function(name, value) {{ this.attributes[name] = value; if (name === "href") {{ this.href = value; }} }},
        getAttribute: function(name) {{ return this.attributes[name] || ""; }},
        click: function() {{ if (this.href) {{ __go(this.href); }} }},
        submit: function() {{ if (this.action) {{ __go(this.action); }} }}
    }};
    return element;
}}
var document = {{
    _cache: {{}},
    cookie: "",
    referrer: "",
    readyState: "complete",
    body: __makeElement("body"),
    createElement: function(tag) {{ return __makeElement(tag); }},
    querySelector: function(sel) {{ return __makeElement(sel); }},
    querySelectorAll: function() {{ return []; }},
    getElementsByTagName: function() {{ return []; }},
    getElementById: function(id) {{
        if (!this._cache[id]) {{ this._cache[id] = __makeElement(id); }}
        return this._cache[id];
    }},
    addEventListener: function(name, cb) {{ if (typeof cb === "function") {{ cb(); }} }},
    write: function() {{}}
}};
Object.defineProperty(document, "location", {{
    get: function() {{ return location; }},
    set: function(target) {{ __go(target); }}
}});
window.document = document;
function __runTimer(cb) {{
    if (typeof cb === "function") {{ cb(); }}
    else if (typeof cb === "string") {{ eval(cb); }}
    return 0;
}}
function setTimeout(cb) {{ return __runTimer(cb); }}
function setInterval(cb) {{ return __runTimer(cb); }}
function clearTimeout() {{}}
function clearInterval() {{}}
window.setTimeout = setTimeout;
window.setInterval = setInterval;
var __b64 = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
function atob(input) {{
    var str = String(input).replace(/[^A-Za-z0-9+\/]/g, "");
    var out = "";
    var buffer = 0;
    var bits = 0;
    for (var i = 0; i < str.length; i++) {{
        buffer = (buffer << 6) | __b64.indexOf(str.charAt(i));
        bits += 6;
        if (bits >= 8) {{
            bits -= 8;
            out += String.fromCharCode((buffer >> bits) & 0xff);
            buffer &= (1 << bits) - 1;
        }}
    }}
    return out;
}}
window.atob = atob;
var console = {{ log: function() {{}}, warn: function() {{}}, error: function() {{}} }};
"#
        )
    }

    fn context(&self, page_url: &Url) -> InterpreterResult<Context> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
        context
            .runtime_limits_mut()
            .set_recursion_limit(RECURSION_LIMIT);

        let prelude = self.build_prelude(page_url);
        context
            .eval(Source::from_bytes(&prelude))
            .map_err(|err| InterpreterError::Engine(err.to_string()))?;
        Ok(context)
    }
}

fn escape_js(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn value_to_string(value: &JsValue, context: &mut Context) -> InterpreterResult<String> {
    value
        .to_string(context)
        .map_err(|err| InterpreterError::Execution(err.to_string()))?
        .to_std_string()
        .map_err(|_| InterpreterError::Engine("unable to convert interpreter output".into()))
}

impl JavascriptInterpreter for BoaJavascriptInterpreter {
    fn capture_redirect(
        &self,
        scripts: &[String],
        page_url: &Url,
    ) -> InterpreterResult<Option<String>> {
        let mut context = self.context(page_url)?;

        for script in scripts {
            if script.trim().is_empty() {
                continue;
            }
            // Page scripts reference DOM APIs the stub lacks; keep going.
            if let Err(err) = context.eval(Source::from_bytes(script)) {
                log::trace!("[javascript] script raised: {}", err);
            }
        }

        let captured = context
            .eval(Source::from_bytes(
                r#"typeof location === "string" ? location : __redirect"#,
            ))
            .map_err(|err| InterpreterError::Engine(err.to_string()))?;

        if captured.is_null() || captured.is_undefined() {
            return Ok(None);
        }
        value_to_string(&captured, &mut context).map(Some)
    }

    fn evaluate(&self, expression: &str, page_url: &Url) -> InterpreterResult<String> {
        let mut context = self.context(page_url)?;
        let value = context
            .eval(Source::from_bytes(expression))
            .map_err(|err| InterpreterError::Execution(err.to_string()))?;
        value_to_string(&value, &mut context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://short.test/abc").unwrap()
    }

    fn run(script: &str) -> Option<String> {
        BoaJavascriptInterpreter::new()
            .capture_redirect(&[script.to_string()], &page())
            .unwrap()
    }

    #[test]
    fn captures_href_assignment_inside_timer() {
        let script = r#"
            setTimeout(function() {
                var parts = ["https://", "dest.test", "/file"];
                window.location.href = parts.join("");
            }, 5000);
        "#;
        assert_eq!(run(script).as_deref(), Some("https://dest.test/file"));
    }

    #[test]
    fn captures_replace_and_global_reassignment() {
        assert_eq!(
            run(r#"location.replace("https://dest.test/r")"#).as_deref(),
            Some("https://dest.test/r")
        );
        assert_eq!(
            run(r#"location = "https://dest.test/g";"#).as_deref(),
            Some("https://dest.test/g")
        );
    }

    #[test]
    fn decodes_atob_payloads() {
        assert_eq!(
            run(r#"window.location = atob("aHR0cHM6Ly9kZXN0LnRlc3Qvb2s=");"#).as_deref(),
            Some("https://dest.test/ok")
        );
    }

    #[test]
    fn script_errors_do_not_abort_later_scripts() {
        let scripts = vec![
            "undefinedFunction();".to_string(),
            r#"window.open("https://dest.test/after")"#.to_string(),
        ];
        let captured = BoaJavascriptInterpreter::new()
            .capture_redirect(&scripts, &page())
            .unwrap();
        assert_eq!(captured.as_deref(), Some("https://dest.test/after"));
    }

    #[test]
    fn no_navigation_yields_none() {
        assert_eq!(run("var a = 1 + 2;"), None);
    }

    #[test]
    fn evaluates_string_expressions() {
        let value = BoaJavascriptInterpreter::new()
            .evaluate("String.fromCharCode(104, 116, 116, 112) + 's://x.test'", &page())
            .unwrap();
        assert_eq!(value, "https://x.test");
    }
}
