//! Browser host bindings
//!
//! - Terminal output goes to `console.log` (stdout) and `console.warn` (stderr)
//! - Terminal input comes from `window.prompt`
//! - The module binary is fetched with `window.fetch`

use super::{ConsoleStream, PlatformError, PlatformResult};
use crate::devices::{LineSink, LineSource};
use std::io;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> f64 {
    js_sys::Date::now()
}

/// High resolution milliseconds from `performance.now()`
pub fn perf_now() -> f64 {
    web_sys::window()
        .and_then(|w| w.performance())
        .map(|p| p.now())
        .unwrap_or_else(js_sys::Date::now)
}

pub struct ConsoleSink {
    stream: ConsoleStream,
}

impl LineSink for ConsoleSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let value: wasm_bindgen::JsValue = line.into();
        match self.stream {
            ConsoleStream::Out => web_sys::console::log_1(&value),
            ConsoleStream::Err => web_sys::console::warn_1(&value),
        }
        Ok(())
    }
}

pub fn console(stream: ConsoleStream) -> Box<dyn LineSink> {
    Box::new(ConsoleSink { stream })
}

/// Asks the user for each input line with `window.prompt`
pub struct PromptLines;

impl LineSource for PromptLines {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let window = web_sys::window().ok_or_else(|| io::Error::other("no window object"))?;
        window
            .prompt_with_message("Input: ")
            .map_err(|e| io::Error::other(format!("prompt failed: {:?}", e)))
    }
}

pub fn stdin_lines() -> Box<dyn LineSource> {
    Box::new(PromptLines)
}

/// Fetch `url` and return the response body
pub async fn fetch_bytes(url: &str) -> PlatformResult<Vec<u8>> {
    let window = web_sys::window().ok_or_else(|| PlatformError::NotSupported("no window object".into()))?;

    let opts = web_sys::RequestInit::new();
    opts.set_method("GET");
    opts.set_mode(web_sys::RequestMode::SameOrigin);

    let request = web_sys::Request::new_with_str_and_init(url, &opts)
        .map_err(|e| PlatformError::Request(format!("failed to create request: {:?}", e)))?;

    let resp_value = JsFuture::from(window.fetch_with_request(&request))
        .await
        .map_err(|e| PlatformError::Request(format!("fetch failed: {:?}", e)))?;

    let resp: web_sys::Response = resp_value
        .dyn_into()
        .map_err(|_| PlatformError::Request("failed to cast response".into()))?;

    if !resp.ok() {
        return Err(PlatformError::Request(format!(
            "HTTP {} {}",
            resp.status(),
            resp.status_text()
        )));
    }

    let array_buffer = JsFuture::from(
        resp.array_buffer()
            .map_err(|e| PlatformError::Io(format!("failed to get body: {:?}", e)))?,
    )
    .await
    .map_err(|e| PlatformError::Io(format!("failed to read body: {:?}", e)))?;

    Ok(js_sys::Uint8Array::new(&array_buffer).to_vec())
}
