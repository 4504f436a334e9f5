//! Connection intent carried in the upgrade request's query string.

use protocol::{DEFAULT_COLS, DEFAULT_ROWS};
use tokio_tungstenite::tungstenite::http::Uri;

use crate::session::CreateSessionRequest;

/// What a connecting client asked for: an existing session to resume, or
/// the parameters for a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectIntent {
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub name: Option<String>,
    pub device_label: Option<String>,
}

impl Default for ConnectIntent {
    fn default() -> Self {
        Self {
            session_id: None,
            cwd: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            name: None,
            device_label: None,
        }
    }
}

impl ConnectIntent {
    pub fn from_uri(uri: &Uri) -> Self {
        Self::from_query(uri.query())
    }

    /// Parses the query string. Unknown keys are ignored, empty values are
    /// treated as absent, and unusable geometry falls back to 80x24.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut intent = Self::default();
        let Some(query) = query else {
            return intent;
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "sessionId" => intent.session_id = Some(value.to_string()),
                "cwd" => intent.cwd = Some(value.to_string()),
                "cols" => intent.cols = parse_dimension(value, DEFAULT_COLS),
                "rows" => intent.rows = parse_dimension(value, DEFAULT_ROWS),
                "name" => intent.name = Some(value.to_string()),
                "deviceName" | "deviceLabel" => intent.device_label = Some(value.to_string()),
                _ => {}
            }
        }

        intent
    }

    pub fn create_request(&self) -> CreateSessionRequest {
        CreateSessionRequest {
            cwd: self.cwd.clone(),
            cols: self.cols,
            rows: self.rows,
            name: self.name.clone(),
            device_label: self.device_label.clone(),
            ..Default::default()
        }
    }
}

fn parse_dimension(value: &str, default: u16) -> u16 {
    match value.parse::<u16>() {
        Ok(n) if n > 0 => n,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query_uses_defaults() {
        let intent = ConnectIntent::from_query(None);
        assert_eq!(intent, ConnectIntent::default());
        assert_eq!(intent.cols, 80);
        assert_eq!(intent.rows, 24);

        assert_eq!(ConnectIntent::from_query(Some("")), ConnectIntent::default());
    }

    #[test]
    fn test_full_query() {
        let intent = ConnectIntent::from_query(Some(
            "token=x&sessionId=abc&cwd=%2Ftmp%2Fproj&cols=120&rows=40&name=build&deviceName=Pixel%207",
        ));
        assert_eq!(intent.session_id.as_deref(), Some("abc"));
        assert_eq!(intent.cwd.as_deref(), Some("/tmp/proj"));
        assert_eq!(intent.cols, 120);
        assert_eq!(intent.rows, 40);
        assert_eq!(intent.name.as_deref(), Some("build"));
        assert_eq!(intent.device_label.as_deref(), Some("Pixel 7"));
    }

    #[test]
    fn test_bad_geometry_falls_back() {
        let intent = ConnectIntent::from_query(Some("cols=wide&rows=0"));
        assert_eq!(intent.cols, 80);
        assert_eq!(intent.rows, 24);

        let intent = ConnectIntent::from_query(Some("cols=-5&rows=70000"));
        assert_eq!(intent.cols, 80);
        assert_eq!(intent.rows, 24);
    }

    #[test]
    fn test_empty_values_ignored() {
        let intent = ConnectIntent::from_query(Some("sessionId=&cwd=&name="));
        assert!(intent.session_id.is_none());
        assert!(intent.cwd.is_none());
        assert!(intent.name.is_none());
    }

    #[test]
    fn test_from_uri() {
        let uri: Uri = "/ws?sessionId=s1&cols=100".parse().unwrap();
        let intent = ConnectIntent::from_uri(&uri);
        assert_eq!(intent.session_id.as_deref(), Some("s1"));
        assert_eq!(intent.cols, 100);
        assert_eq!(intent.rows, 24);
    }

    #[test]
    fn test_create_request() {
        let intent = ConnectIntent::from_query(Some("cwd=/tmp&cols=90&rows=30&name=n&deviceName=d"));
        let request = intent.create_request();
        assert_eq!(request.cwd.as_deref(), Some("/tmp"));
        assert_eq!(request.cols, 90);
        assert_eq!(request.rows, 30);
        assert_eq!(request.name.as_deref(), Some("n"));
        assert_eq!(request.device_label.as_deref(), Some("d"));
        assert!(request.env.is_empty());
    }
}
