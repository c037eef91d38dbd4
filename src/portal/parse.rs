use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tracing::warn;

use crate::portal::FetchError;
use crate::snapshot::{Field, FieldValue, Snapshot};

static HIDDEN_INPUTS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input[name]").expect("static selector is valid"));

/// Value of the login form's anti-forgery input, if the page has one.
pub fn extract_csrf_token(html: &str, field_name: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&HIDDEN_INPUTS)
        .find(|input| input.value().attr("name") == Some(field_name))
        .and_then(|input| input.value().attr("value"))
        .map(str::to_string)
}

/// Attribute selector matching the element id literally inside a quoted CSS string.
fn id_selector(id: &str) -> Result<Selector, String> {
    let escaped = id.replace('\\', "\\\\").replace('"', "\\\"");
    Selector::parse(&format!(r#"[id="{escaped}"]"#)).map_err(|err| err.to_string())
}

/// Builds a snapshot from the dashboard markup. Fields whose element is missing
/// become `Unavailable`; a page with none of the fields is not the dashboard.
pub fn parse_dashboard<'a>(
    html: &str,
    element_id: impl Fn(Field) -> &'a str,
) -> Result<Snapshot, FetchError> {
    let document = Html::parse_document(html);
    let mut values = Vec::with_capacity(Field::ALL.len());

    for field in Field::ALL {
        let id = element_id(field);
        let selector = match id_selector(id) {
            Ok(selector) => selector,
            Err(err) => {
                warn!(field = field.as_slug(), element_id = id, "invalid element id: {err}");
                continue;
            }
        };
        if let Some(element) = document.select(&selector).next() {
            let text = element.text().collect::<String>();
            values.push((field, FieldValue::Text(text.trim().to_string())));
        }
    }

    if values.is_empty() {
        let preview: String = document
            .root_element()
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(120)
            .collect();
        return Err(FetchError::ParseFailed(format!(
            "no dashboard fields found (page starts with: {preview:?})"
        )));
    }

    Ok(Snapshot::from_fields(values))
}

#[cfg(test)]
mod tests {
    use crate::portal::parse::{extract_csrf_token, parse_dashboard};
    use crate::portal::FetchError;
    use crate::snapshot::{Field, FieldValue};

    const DASHBOARD: &str = r#"
<html><body>
  <div id="academic-planning">
    Registration closes Friday
  </div>
  <div id="attendance"><span>85%</span> recorded</div>
  <div id="result-upload"></div>
</body></html>"#;

    #[test]
    fn extracts_present_fields_and_marks_missing_ones_unavailable() {
        let snapshot =
            parse_dashboard(DASHBOARD, |field| field.default_element_id()).expect("dashboard");
        assert_eq!(
            snapshot.get(Field::AcademicPlanning),
            &FieldValue::Text("Registration closes Friday".to_string())
        );
        assert_eq!(
            snapshot.get(Field::Attendance),
            &FieldValue::Text("85% recorded".to_string())
        );
        assert_eq!(
            snapshot.get(Field::ResultUpload),
            &FieldValue::Text(String::new())
        );
        assert_eq!(snapshot.get(Field::ExamConduct), &FieldValue::Unavailable);
    }

    #[test]
    fn unrecognizable_page_fails_whole_fetch() {
        let result = parse_dashboard(
            "<html><body><h1>Please sign in</h1></body></html>",
            |field| field.default_element_id(),
        );
        assert!(matches!(result, Err(FetchError::ParseFailed(_))));
    }

    #[test]
    fn honours_custom_element_ids() {
        let html = r#"<p id="att-box">90%</p>"#;
        let snapshot = parse_dashboard(html, |field| match field {
            Field::Attendance => "att-box",
            other => other.default_element_id(),
        })
        .expect("dashboard");
        assert_eq!(snapshot.available_count(), 1);
    }

    #[test]
    fn element_ids_with_quotes_or_backslashes_match_literally() {
        let html = r#"<p id="att\box">90%</p><p id='say"hi"'>open</p>"#;
        let snapshot = parse_dashboard(html, |field| match field {
            Field::Attendance => r"att\box",
            Field::Resumption => r#"say"hi""#,
            other => other.default_element_id(),
        })
        .expect("dashboard");
        assert_eq!(snapshot.get(Field::Attendance), &FieldValue::Text("90%".to_string()));
        assert_eq!(snapshot.get(Field::Resumption), &FieldValue::Text("open".to_string()));
    }

    #[test]
    fn finds_csrf_token_by_name() {
        let html = r#"<form>
            <input type="hidden" name="other" value="x">
            <input type="hidden" name="csrf_token" value="abc123">
        </form>"#;
        assert_eq!(extract_csrf_token(html, "csrf_token").as_deref(), Some("abc123"));
        assert_eq!(extract_csrf_token(html, "_token"), None);
    }
}
