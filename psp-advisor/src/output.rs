use crate::k8s::PodSecurityPolicy;
use anyhow::Result;
use serde::Serialize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

// === impl OutputFormat ===

impl OutputFormat {
    pub fn render<T: Serialize>(&self, value: &T) -> Result<String> {
        match self {
            Self::Yaml => Ok(serde_yaml::to_string(value)?),
            Self::Json => {
                let mut json = serde_json::to_string_pretty(value)?;
                json.push('\n');
                Ok(json)
            }
        }
    }

    /// Renders policies so that they can be applied with `kubectl apply -f`: a multi-document
    /// stream in YAML, or a `List` in JSON.
    pub fn render_policies(&self, policies: &[PodSecurityPolicy]) -> Result<String> {
        match self {
            Self::Yaml => {
                let documents = policies
                    .iter()
                    .map(serde_yaml::to_string)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(documents.join("---\n"))
            }
            Self::Json => self.render(&serde_json::json!({
                "apiVersion": "v1",
                "kind": "List",
                "items": policies,
            })),
        }
    }
}
