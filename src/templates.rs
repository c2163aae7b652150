//! Page templates served under `/static/`.
//!
//! A template is plain text with `{{ .Name }}` placeholders. Only the
//! variables in [`Variable`] exist; anything else is rejected when the
//! template set is parsed at bootstrap, so rendering itself cannot fail.

use crate::error::TemplateError;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Files under the static directory rendered as templates rather than served raw
pub const TEMPLATE_NAMES: [&str; 4] = [
    "osm-liberty-gl.style",
    "planet.json",
    "index.html",
    "mapbox.html",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    TilesBaseUrl,
    MaxZoom,
    CenterLat,
    CenterLng,
}

impl Variable {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "TilesBaseURL" => Some(Self::TilesBaseUrl),
            "MaxZoom" => Some(Self::MaxZoom),
            "CenterLat" => Some(Self::CenterLat),
            "CenterLng" => Some(Self::CenterLng),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Variable(Variable),
}

/// Values substituted into a template for one request
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateVars {
    pub tiles_base_url: String,
    pub max_zoom: u8,
    pub center_lat: f64,
    pub center_lng: f64,
}

impl TemplateVars {
    fn value(&self, variable: Variable) -> String {
        match variable {
            Variable::TilesBaseUrl => self.tiles_base_url.clone(),
            Variable::MaxZoom => self.max_zoom.to_string(),
            Variable::CenterLat => self.center_lat.to_string(),
            Variable::CenterLng => self.center_lng.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(name: &str, source: &str) -> Result<Self, TemplateError> {
        let parse_error = |offset: usize, reason: String| TemplateError::Parse {
            name: name.to_string(),
            line: source[..offset].matches('\n').count() + 1,
            reason,
        };

        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }

            let action = &rest[start + 2..];
            let end = action
                .find("}}")
                .ok_or_else(|| parse_error(offset + start, "unclosed action".to_string()))?;

            let field = action[..end].trim();
            let field_name = field
                .strip_prefix('.')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    parse_error(offset + start, format!("unexpected \"{}\" in action", field))
                })?;

            let variable = Variable::from_name(field_name).ok_or_else(|| {
                parse_error(offset + start, format!("unknown variable .{}", field_name))
            })?;
            segments.push(Segment::Variable(variable));

            let consumed = start + 2 + end + 2;
            rest = &rest[consumed..];
            offset += consumed;
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, vars: &TemplateVars) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(variable) => out.push_str(&vars.value(*variable)),
            }
        }
        out
    }
}

/// Templates parsed once at bootstrap, looked up by file name
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, Template>,
}

impl TemplateSet {
    /// Read and parse every named file from `dir`; the first failure aborts
    pub async fn parse_dir<P: AsRef<Path>>(dir: P, names: &[&str]) -> Result<Self, TemplateError> {
        let dir = dir.as_ref();
        let mut templates = HashMap::new();

        for name in names {
            let source = tokio::fs::read_to_string(dir.join(name))
                .await
                .map_err(|e| TemplateError::Read {
                    name: name.to_string(),
                    source: e,
                })?;

            templates.insert(name.to_string(), Template::parse(name, &source)?);
            debug!("Parsed template {}", name);
        }

        Ok(Self { templates })
    }

    pub fn insert(&mut self, name: &str, template: Template) {
        self.templates.insert(name.to_string(), template);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn render(&self, name: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
        self.templates
            .get(name)
            .map(|template| template.render(vars))
            .ok_or_else(|| TemplateError::Undefined {
                name: name.to_string(),
            })
    }
}

/// Content type derived from the file extension
pub fn content_type_for(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("json") | Some("style") => "application/json",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("pbf") => "application/x-protobuf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars {
            tiles_base_url: "https://tiles.example.com".to_string(),
            max_zoom: 14,
            center_lat: 48.85,
            center_lng: 2.35,
        }
    }

    #[test]
    fn test_render_substitutes_verbatim() {
        let template = Template::parse(
            "index.html",
            "<script>var url = \"{{.TilesBaseURL}}/tiles/{z}/{x}/{y}\";\ncenter: [{{ .CenterLng }}, {{.CenterLat}}], maxZoom: {{.MaxZoom}}</script>",
        )
        .unwrap();

        assert_eq!(
            template.render(&vars()),
            "<script>var url = \"https://tiles.example.com/tiles/{z}/{x}/{y}\";\ncenter: [2.35, 48.85], maxZoom: 14</script>"
        );
    }

    #[test]
    fn test_plain_text_is_unchanged() {
        let template = Template::parse("planet.json", "{\"tiles\": []}").unwrap();
        assert_eq!(template.render(&vars()), "{\"tiles\": []}");
    }

    #[test]
    fn test_unclosed_action_reports_line() {
        let err = Template::parse("index.html", "<html>\n<body>\n{{.MaxZoom</body>").unwrap_err();
        match err {
            TemplateError::Parse { name, line, .. } => {
                assert_eq!(name, "index.html");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_variable_is_rejected() {
        assert!(matches!(
            Template::parse("mapbox.html", "{{.AccessToken}}"),
            Err(TemplateError::Parse { .. })
        ));
        assert!(matches!(
            Template::parse("mapbox.html", "{{ }}"),
            Err(TemplateError::Parse { .. })
        ));
        assert!(matches!(
            Template::parse("mapbox.html", "{{MaxZoom}}"),
            Err(TemplateError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_parse_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in TEMPLATE_NAMES {
            std::fs::write(dir.path().join(name), "zoom={{.MaxZoom}}").unwrap();
        }

        let set = TemplateSet::parse_dir(dir.path(), &TEMPLATE_NAMES).await.unwrap();
        assert!(set.contains("index.html"));
        assert!(!set.contains("style.css"));
        assert_eq!(set.render("planet.json", &vars()).unwrap(), "zoom=14");
        assert!(matches!(
            set.render("style.css", &vars()),
            Err(TemplateError::Undefined { .. })
        ));
    }

    #[tokio::test]
    async fn test_parse_dir_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "ok").unwrap();

        let err = TemplateSet::parse_dir(dir.path(), &TEMPLATE_NAMES).await.unwrap_err();
        assert!(matches!(err, TemplateError::Read { .. }));
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("planet.json"), "application/json");
        assert_eq!(content_type_for("osm-liberty-gl.style"), "application/json");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }
}
