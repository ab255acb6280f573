use serde::{Deserialize, Serialize};
use url::Url;

const DEMO_HOST_FRAGMENT: &str = "mysellkit.com";
const DEMO_PATH_FRAGMENT: &str = "/demo/";
const QUERY_FLAGS: [&str; 2] = ["debug", "mysellkit_test"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSource {
    QueryParameter,
    EmbedAttribute,
    DemoPage,
}

impl DiagnosticSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueryParameter => "query_parameter",
            Self::EmbedAttribute => "embed_attribute",
            Self::DemoPage => "demo_page",
        }
    }
}

/// Page-level diagnostic override, resolved once per page load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Diagnostic {
    pub enabled: bool,
    pub source: Option<DiagnosticSource>,
}

impl Diagnostic {
    #[must_use]
    pub fn off() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn forced(source: DiagnosticSource) -> Self {
        Self { enabled: true, source: Some(source) }
    }

    /// Resolve the override from the page URL and the embed's debug attribute.
    ///
    /// Query flags win over the attribute, which wins over demo-page detection. Only the
    /// literal value `true` enables a query flag.
    #[must_use]
    pub fn detect(page_url: &Url, embed_attribute: bool) -> Self {
        let query_flag = page_url
            .query_pairs()
            .any(|(name, value)| QUERY_FLAGS.contains(&name.as_ref()) && value == "true");
        if query_flag {
            return Self::forced(DiagnosticSource::QueryParameter);
        }
        if embed_attribute {
            return Self::forced(DiagnosticSource::EmbedAttribute);
        }
        let demo_page = page_url.host_str().is_some_and(|host| host.contains(DEMO_HOST_FRAGMENT))
            && page_url.path().contains(DEMO_PATH_FRAGMENT);
        if demo_page {
            return Self::forced(DiagnosticSource::DemoPage);
        }
        Self::off()
    }
}
