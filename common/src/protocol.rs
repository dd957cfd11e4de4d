//! JSON bodies exchanged over the HTTP API.
//!
use serde::{Deserialize, Serialize};

/// Result of classifying one uploaded image.
///
/// `video1` and `video2` are reference strings attached to the predicted class
/// and are passed through untouched.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Classification {
    pub predicted_value: String,
    pub details: String,
    pub video1: String,
    pub video2: String,
}

impl Classification {
    pub fn new(
        predicted_value: impl Into<String>,
        details: impl Into<String>,
        video1: impl Into<String>,
        video2: impl Into<String>,
    ) -> Self {
        Self {
            predicted_value: predicted_value.into(),
            details: details.into(),
            video1: video1.into(),
            video2: video2.into(),
        }
    }
}

/// Body of every non-200 response.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    #[test]
    fn test_classification_has_exactly_four_keys() -> Result<(), Error> {
        let classification = Classification::new("Plastic", "Recyclable", "a", "b");

        let value = serde_json::to_value(&classification)?;
        let object = value.as_object().ok_or("not an object")?;

        let mut keys: Vec<_> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["details", "predicted_value", "video1", "video2"]);
        assert_eq!(object["predicted_value"], "Plastic");

        Ok(())
    }

    #[test]
    fn test_error_body_shape() -> Result<(), Error> {
        let body = serde_json::to_string(&ErrorBody::new("no file"))?;
        assert_eq!(body, r#"{"error":"no file"}"#);

        Ok(())
    }
}
