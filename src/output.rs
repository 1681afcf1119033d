use serde::Serialize;
use serde_json::ser::Formatter;
use std::io;

// compact JSON, but with ", " and ": " separators
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Render `value` as a single JSON line without the trailing newline.
pub fn to_json_line<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    value.serialize(&mut ser)?;
    // serde_json only emits UTF-8
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{Outcome, Prediction};

    #[test]
    fn test_usage_error_line() {
        let line = to_json_line(&Outcome::error("No image path provided")).unwrap();
        assert_eq!(line, r#"{"error": "No image path provided"}"#);
    }

    #[test]
    fn test_prediction_line() {
        let outcome = Outcome::Prediction(Prediction {
            label: "dog".to_string(),
            confidence: 0.7,
        });
        assert_eq!(
            to_json_line(&outcome).unwrap(),
            r#"{"label": "dog", "confidence": 0.7}"#
        );
    }

    #[test]
    fn test_nested_values() {
        let value = serde_json::json!({"a": [1, 2], "b": {"c": null}});
        assert_eq!(
            to_json_line(&value).unwrap(),
            r#"{"a": [1, 2], "b": {"c": null}}"#
        );
    }
}
