use std::env;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb};
use recoat_contracts::session::{RepaintRequest, RoomImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Failure message for a well-formed response with no usable image part.
pub const NO_IMAGE_MESSAGE: &str = "the model produced no image";

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Transport knobs for one repaint call. The contract stays one
/// user-triggered attempt; `retry_transient_once` opts into a single extra
/// attempt after a transient transport failure (timeout, connect, or an
/// interrupted send), never after an HTTP error.
#[derive(Debug, Clone)]
pub struct RepaintOptions {
    pub model: String,
    pub request_timeout: Duration,
    pub retry_transient_once: bool,
}

impl Default for RepaintOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_IMAGE_MODEL.to_string(),
            request_timeout: Duration::from_secs(90),
            retry_transient_once: false,
        }
    }
}

/// The seam the front end drives: one request in, one repainted image out.
pub trait WallPainter {
    fn name(&self) -> &str;
    fn repaint(&self, request: &RepaintRequest) -> Result<RoomImage>;
}

/// Builds the instruction the external model steers by. The wording is the
/// entire walls-only mechanism; there is no local segmentation.
pub fn wall_repaint_prompt(color_description: &str) -> String {
    format!(
        "Repaint the walls of this room. \
         The new wall appearance should be: \"{color_description}\". \
         Keep all original furniture, lighting and shadows, flooring, ceiling, \
         and architectural details exactly as they are. \
         The result must be high quality, photorealistic, and look like a \
         professional interior design photo. \
         Do not change the color of the ceiling or the floor. \
         Only the vertical wall surfaces."
    )
}

pub struct GeminiPainter {
    api_base: String,
    api_key: Option<String>,
    options: RepaintOptions,
    http: HttpClient,
}

impl GeminiPainter {
    pub fn from_env(options: RepaintOptions) -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            options,
            http: HttpClient::new(),
        }
    }

    pub fn with_endpoint(
        api_base: impl Into<String>,
        api_key: Option<String>,
        options: RepaintOptions,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            options,
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        let model = self.options.model.trim();
        let model_path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &RepaintRequest) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.media_type,
                            "data": BASE64.encode(&request.image_data),
                        }
                    },
                    { "text": wall_repaint_prompt(&request.color_description) },
                ],
            })]),
        );

        let mut generation_config = Map::new();
        generation_config.insert("candidateCount".to_string(), json!(1));
        generation_config.insert("responseModalities".to_string(), json!(["IMAGE"]));
        payload.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );

        Value::Object(payload)
    }

    fn post_payload(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<HttpResponse> {
        let max_attempts = if self.options.retry_transient_once { 2 } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(self.options.request_timeout)
                .json(payload)
                .send();
            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("repaint request failed ({endpoint})"));
                    if attempt >= max_attempts || !is_retryable_transport_error(&err) {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// First candidate, first part with non-empty inline data wins. Later
    /// candidates are never consulted.
    fn extract_first_image(payload: &Value) -> Result<Option<RoomImage>> {
        let Some(candidate) = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
        else {
            return Ok(None);
        };
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("returned image failed base64 decode")?;
            let media_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string();
            return Ok(Some(RoomImage::new(bytes, media_type)));
        }
        Ok(None)
    }
}

impl WallPainter for GeminiPainter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn repaint(&self, request: &RepaintRequest) -> Result<RoomImage> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("missing API key: set GEMINI_API_KEY or GOOGLE_API_KEY");
        };
        if request.color_description.trim().is_empty() {
            bail!("color description is empty");
        }

        let endpoint = self.endpoint();
        let payload = Self::build_payload(request);
        let response = self.post_payload(&endpoint, api_key, &payload)?;
        let response_payload = response_json_or_error("Gemini", response)?;
        let Some(image) = Self::extract_first_image(&response_payload)? else {
            bail!("{NO_IMAGE_MESSAGE}");
        };
        Ok(image)
    }
}

/// Network-free backend for tests and `--dryrun` development runs: tints the
/// uploaded photo toward a color hashed from the description and returns it
/// as PNG.
pub struct DryrunPainter;

impl WallPainter for DryrunPainter {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn repaint(&self, request: &RepaintRequest) -> Result<RoomImage> {
        if request.color_description.trim().is_empty() {
            bail!("color description is empty");
        }
        let decoded = image::load_from_memory(&request.image_data)
            .context("input is not a decodable image")?;
        let mut canvas = decoded.to_rgb8();
        let (r, g, b) = color_from_description(&request.color_description);
        for pixel in canvas.pixels_mut() {
            let Rgb([pr, pg, pb]) = *pixel;
            *pixel = Rgb([
                ((pr as u16 + r as u16) / 2) as u8,
                ((pg as u16 + g as u16) / 2) as u8,
                ((pb as u16 + b as u16) / 2) as u8,
            ]);
        }
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .context("failed to encode dryrun image")?;
        Ok(RoomImage::new(out, "image/png"))
    }
}

fn color_from_description(description: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

/// Short stable id for one request, used in event payloads.
pub fn request_fingerprint(request: &RepaintRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&request.image_data);
    hasher.update(request.color_description.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

pub fn media_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub fn extension_for_media_type(media_type: &str) -> &'static str {
    let lowered = media_type.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    "png"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use base64::Engine as _;
    use image::{ImageFormat, RgbImage};
    use recoat_contracts::session::RepaintRequest;
    use serde_json::json;

    use super::{
        extension_for_media_type, media_type_for_path, request_fingerprint, wall_repaint_prompt,
        DryrunPainter, GeminiPainter, RepaintOptions, WallPainter, BASE64, NO_IMAGE_MESSAGE,
    };

    fn sample_request() -> RepaintRequest {
        RepaintRequest {
            image_data: vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a],
            media_type: "image/png".to_string(),
            color_description: "soft sage green".to_string(),
        }
    }

    fn spawn_stub(status: &'static str, body: String) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
        let base = format!("http://{}", listener.local_addr().expect("stub addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming().take(4) {
                let Ok(mut stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                read_http_request(&mut stream);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (base, hits)
    }

    /// Drops the first accepted connection before any response is written;
    /// later connections are served normally.
    fn spawn_flaky_stub(status: &'static str, body: String) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
        let base = format!("http://{}", listener.local_addr().expect("stub addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            let mut dropped_first = false;
            for stream in listener.incoming().take(4) {
                let Ok(mut stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                if !dropped_first {
                    dropped_first = true;
                    drop(stream);
                    continue;
                }
                read_http_request(&mut stream);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (base, hits)
    }

    fn read_http_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut content_length = 0usize;
        let mut header_end = None;
        loop {
            let Ok(read) = stream.read(&mut chunk) else {
                return;
            };
            if read == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..read]);
            if header_end.is_none() {
                if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
                    header_end = Some(pos + 4);
                    let headers = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                    for line in headers.lines() {
                        if let Some(value) = line.strip_prefix("content-length:") {
                            content_length = value.trim().parse().unwrap_or(0);
                        }
                    }
                }
            }
            if let Some(end) = header_end {
                if buf.len() >= end + content_length {
                    return;
                }
            }
        }
    }

    fn image_response_body(bytes: &[u8], media_type: &str) -> String {
        json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "repainted as requested" },
                        { "inlineData": { "mimeType": media_type, "data": BASE64.encode(bytes) } },
                    ],
                }
            }]
        })
        .to_string()
    }

    #[test]
    fn prompt_embeds_description_and_preservation_instructions() {
        let prompt = wall_repaint_prompt("earthy terracotta orange");
        assert!(prompt.contains("\"earthy terracotta orange\""));
        assert!(prompt.contains("furniture"));
        assert!(prompt.contains("ceiling"));
        assert!(prompt.contains("photorealistic"));
        assert!(prompt.contains("vertical wall surfaces"));
    }

    #[test]
    fn successful_response_round_trips_image_bytes() {
        let payload = vec![10u8, 20, 30, 40, 50];
        let (base, hits) = spawn_stub("200 OK", image_response_body(&payload, "image/png"));
        let painter = GeminiPainter::with_endpoint(
            base,
            Some("test-key".to_string()),
            RepaintOptions::default(),
        );
        let generated = painter.repaint(&sample_request()).expect("repaint");
        assert_eq!(generated.data, payload);
        assert_eq!(generated.media_type, "image/png");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_api_key_fails_before_any_outbound_call() {
        let (base, hits) = spawn_stub("200 OK", image_response_body(&[1, 2], "image/png"));
        let painter = GeminiPainter::with_endpoint(base, None, RepaintOptions::default());
        let err = painter.repaint(&sample_request()).unwrap_err();
        assert!(err.to_string().contains("missing API key"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_candidate_list_reports_no_image() {
        let (base, hits) = spawn_stub("200 OK", json!({ "candidates": [] }).to_string());
        let painter = GeminiPainter::with_endpoint(
            base,
            Some("test-key".to_string()),
            RepaintOptions::default(),
        );
        let err = painter.repaint(&sample_request()).unwrap_err();
        assert!(err.to_string().contains(NO_IMAGE_MESSAGE));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn candidate_without_image_part_reports_no_image() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "sorry, words only" }] }
            }]
        })
        .to_string();
        let (base, _hits) = spawn_stub("200 OK", body);
        let painter = GeminiPainter::with_endpoint(
            base,
            Some("test-key".to_string()),
            RepaintOptions::default(),
        );
        let err = painter.repaint(&sample_request()).unwrap_err();
        assert!(err.to_string().contains(NO_IMAGE_MESSAGE));
    }

    #[test]
    fn upstream_error_body_is_preserved_in_failure() {
        let (base, hits) = spawn_stub("429 Too Many Requests", "quota exceeded".to_string());
        let painter = GeminiPainter::with_endpoint(
            base,
            Some("test-key".to_string()),
            RepaintOptions::default(),
        );
        let err = painter.repaint(&sample_request()).unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("quota exceeded"));
        assert!(rendered.contains("429"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn http_error_is_never_retried_even_with_transient_retry_enabled() {
        let (base, hits) = spawn_stub("500 Internal Server Error", "backend down".to_string());
        let options = RepaintOptions {
            retry_transient_once: true,
            ..RepaintOptions::default()
        };
        let painter = GeminiPainter::with_endpoint(base, Some("test-key".to_string()), options);
        let err = painter.repaint(&sample_request()).unwrap_err();
        assert!(format!("{err:#}").contains("backend down"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_failure_is_retried_once_when_enabled() {
        let payload = vec![3u8, 1, 4, 1, 5];
        let (base, hits) = spawn_flaky_stub("200 OK", image_response_body(&payload, "image/png"));
        let options = RepaintOptions {
            retry_transient_once: true,
            ..RepaintOptions::default()
        };
        let painter = GeminiPainter::with_endpoint(base, Some("test-key".to_string()), options);
        let generated = painter
            .repaint(&sample_request())
            .expect("second attempt succeeds");
        assert_eq!(generated.data, payload);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn transient_failure_is_not_retried_by_default() {
        let (base, hits) = spawn_flaky_stub("200 OK", image_response_body(&[1], "image/png"));
        let painter = GeminiPainter::with_endpoint(
            base,
            Some("test-key".to_string()),
            RepaintOptions::default(),
        );
        let err = painter.repaint(&sample_request()).unwrap_err();
        assert!(format!("{err:#}").contains("repaint request failed"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_color_description_is_rejected_without_a_call() {
        let (base, hits) = spawn_stub("200 OK", image_response_body(&[1], "image/png"));
        let painter = GeminiPainter::with_endpoint(
            base,
            Some("test-key".to_string()),
            RepaintOptions::default(),
        );
        let mut request = sample_request();
        request.color_description = "   ".to_string();
        let err = painter.repaint(&request).unwrap_err();
        assert!(err.to_string().contains("color description is empty"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn extraction_only_consults_the_first_candidate() {
        let payload = json!({
            "candidates": [
                { "content": { "parts": [{ "text": "no image here" }] } },
                { "content": { "parts": [
                    { "inlineData": { "mimeType": "image/png", "data": BASE64.encode([9u8, 9]) } }
                ] } },
            ]
        });
        let extracted = GeminiPainter::extract_first_image(&payload).unwrap();
        assert!(extracted.is_none());
    }

    #[test]
    fn extraction_accepts_snake_case_inline_data() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [
                    { "inline_data": { "mime_type": "image/jpeg", "data": BASE64.encode([5u8, 6, 7]) } }
                ] }
            }]
        });
        let extracted = GeminiPainter::extract_first_image(&payload)
            .unwrap()
            .expect("image part");
        assert_eq!(extracted.data, vec![5, 6, 7]);
        assert_eq!(extracted.media_type, "image/jpeg");
    }

    #[test]
    fn dryrun_painter_returns_decodable_png_of_same_dimensions() {
        let mut input = Vec::new();
        RgbImage::from_pixel(6, 4, image::Rgb([200, 180, 160]))
            .write_to(&mut Cursor::new(&mut input), ImageFormat::Png)
            .expect("encode fixture");
        let request = RepaintRequest {
            image_data: input,
            media_type: "image/png".to_string(),
            color_description: "deep navy blue".to_string(),
        };
        let generated = DryrunPainter.repaint(&request).expect("dryrun repaint");
        assert_eq!(generated.media_type, "image/png");
        let decoded = image::load_from_memory(&generated.data).expect("decodable output");
        assert_eq!((decoded.width(), decoded.height()), (6, 4));
    }

    #[test]
    fn dryrun_painter_rejects_non_image_bytes() {
        let request = RepaintRequest {
            image_data: b"not an image".to_vec(),
            media_type: "image/png".to_string(),
            color_description: "matte black".to_string(),
        };
        let err = DryrunPainter.repaint(&request).unwrap_err();
        assert!(err.to_string().contains("not a decodable image"));
    }

    #[test]
    fn media_type_lookup_covers_common_extensions() {
        assert_eq!(media_type_for_path(Path::new("room.PNG")), Some("image/png"));
        assert_eq!(
            media_type_for_path(Path::new("room.jpeg")),
            Some("image/jpeg")
        );
        assert_eq!(media_type_for_path(Path::new("notes.txt")), None);
        assert_eq!(media_type_for_path(Path::new("no_extension")), None);
    }

    #[test]
    fn extension_follows_reported_media_type_with_png_fallback() {
        assert_eq!(extension_for_media_type("image/jpeg"), "jpg");
        assert_eq!(extension_for_media_type("IMAGE/WEBP"), "webp");
        assert_eq!(extension_for_media_type("application/octet-stream"), "png");
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let request = sample_request();
        assert_eq!(request_fingerprint(&request), request_fingerprint(&request));
        let mut other = sample_request();
        other.color_description = "matte black".to_string();
        assert_ne!(request_fingerprint(&request), request_fingerprint(&other));
        assert_eq!(request_fingerprint(&request).len(), 8);
    }
}
