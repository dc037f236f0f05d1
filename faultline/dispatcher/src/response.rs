//! Structured experiment responses and the output decoding ladder.
//!
//! Fault helpers report business-level results as a JSON object, but wrap it
//! in log noise, sometimes on stderr, and sometimes exit non-zero for
//! unrelated reasons. Decoding therefore walks an ordered list of
//! extractors and always prefers an output-derived response over generic
//! error wrapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{code, DispatchError};

pub const EMPTY_OUTPUT_TIP: &str =
    "cannot get result message from container, please execute recovery and try again";

/// Result of one dispatch, also the wire shape the helpers print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Response {
    pub fn ok(result: impl Into<Value>) -> Self {
        Response {
            code: code::OK,
            success: true,
            err: None,
            result: Some(result.into()),
        }
    }

    pub fn fail(code: i32, err: impl Into<String>) -> Self {
        Response {
            code,
            success: false,
            err: Some(err.into()),
            result: None,
        }
    }
}

impl From<&DispatchError> for Response {
    fn from(error: &DispatchError) -> Self {
        Response::fail(error.code(), error.to_string())
    }
}

impl From<DispatchError> for Response {
    fn from(error: DispatchError) -> Self {
        Response::from(&error)
    }
}

fn json_shaped(text: &str) -> bool {
    text.starts_with('{') && text.ends_with('}')
}

fn decode_json(text: &str) -> Option<Response> {
    let text = text.trim();
    if !json_shaped(text) {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// Extractor 1: the first line that decodes as a response wins.
fn from_any_line(output: &str) -> Option<Response> {
    output.lines().find_map(decode_json)
}

/// Extractor 2: the whole trimmed blob.
fn from_whole(output: &str) -> Option<Response> {
    decode_json(output)
}

const OUTPUT_EXTRACTORS: &[fn(&str) -> Option<Response>] = &[from_any_line, from_whole];

/// Decode helper output into a [`Response`].
///
/// `err` is the wrapper-process failure, if any; it is consulted only after
/// every output extractor has come up empty, since helpers report failures
/// on stdout while the wrapper may exit non-zero for unrelated reasons.
pub fn decode_output(output: &str, err: Option<&str>) -> Response {
    let output = output.trim();

    for extract in OUTPUT_EXTRACTORS {
        if let Some(response) = extract(output) {
            trace!(?response, "decoded response from helper output");
            return response;
        }
    }

    if let Some(err) = err {
        if let Some(response) = decode_json(err) {
            return response;
        }
        return Response::fail(
            code::CONTAINER_EXEC_FAILED,
            format!("execContainer: {err}"),
        );
    }

    if output.is_empty() {
        return Response::fail(code::CONTAINER_EXEC_FAILED, EMPTY_OUTPUT_TIP);
    }

    // Non-JSON output with a clean exit: surface the raw text so that the
    // caller at least sees what the helper said.
    Response::fail(code::CONTAINER_EXEC_FAILED, output)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn plain_json_decodes() {
        let response = decode_output(r#"{"code":200,"success":true,"result":"exp-1"}"#, None);
        assert!(response.success);
        assert_eq!(response.code, 200);
        assert_eq!(response.result, Some("exp-1".into()));
    }

    #[test]
    fn json_on_middle_line_wins() {
        let output = "setting up tc rules\n{\"code\":200,\"success\":true,\"result\":\"exp-1\"}\ndone";
        let response = decode_output(output, None);
        assert!(response.success);
        assert_eq!(response.result, Some("exp-1".into()));
    }

    #[test]
    fn multiline_blob_decodes_as_whole() {
        let output = "{\n  \"code\": 200,\n  \"success\": true\n}";
        assert!(decode_output(output, None).success);
    }

    #[test]
    fn output_preferred_over_error() {
        let output = r#"{"code":56003,"success":false,"err":"uid exp-1 already exists"}"#;
        let response = decode_output(output, Some("exit status 1"));
        assert_eq!(response.code, 56003);
        assert_eq!(response.err.as_deref(), Some("uid exp-1 already exists"));
    }

    #[test]
    fn error_string_decoded_as_json() {
        let response = decode_output("", Some(r#"{"code":200,"success":true}"#));
        assert!(response.success);
    }

    #[test]
    fn undecodable_error_becomes_exec_failure() {
        let response = decode_output("", Some("exit status 1"));
        assert_eq!(response.code, code::CONTAINER_EXEC_FAILED);
        assert!(response.err.unwrap().contains("exit status 1"));
    }

    #[test]
    fn empty_output_is_a_failure_with_tip() {
        let response = decode_output("   \n", None);
        assert_eq!(response.code, code::CONTAINER_EXEC_FAILED);
        assert_eq!(response.err.as_deref(), Some(EMPTY_OUTPUT_TIP));
    }

    #[rstest]
    #[case("tc: command not found")]
    #[case("{not json")]
    fn raw_text_is_surfaced(#[case] output: &str) {
        let response = decode_output(output, None);
        assert!(!response.success);
        assert_eq!(response.err.as_deref(), Some(output));
    }
}
