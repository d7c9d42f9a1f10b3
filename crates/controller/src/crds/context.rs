/*
 * 5D Labs Agent Platform - Task Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Context items shared by `Task`, `Agent` and `TaskTemplate`

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One piece of input content contributed to a Task's workspace.
///
/// Items without a `mountPath` are aggregated into the task instructions file;
/// items with one are materialized individually at that path.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    /// Identifier used in the aggregate delimiter and in log output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Free-form description of the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Target path; relative paths are resolved under the workspace directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    /// Octal file mode for mounted files (e.g. 0o755 as 493)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<i32>,

    #[serde(flatten)]
    pub source: ContextSource,
}

/// Where the content of a [`ContextItem`] comes from
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(tag = "type")]
pub enum ContextSource {
    /// Inline text
    Text {
        #[serde(default)]
        text: String,
    },
    /// A key/value bundle stored in a `ConfigMap`
    ConfigMap {
        #[serde(rename = "configMap")]
        config_map: ConfigMapSource,
    },
    /// A git repository cloned into the workspace
    Git { git: GitSource },
    /// Platform-awareness instructions synthesized by the controller
    Runtime,
    /// Remote content fetched over HTTP(S)
    #[serde(rename = "URL")]
    Url { url: UrlSource },
}

impl ContextSource {
    /// Short type name written into the aggregate delimiter
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "Text",
            Self::ConfigMap { .. } => "ConfigMap",
            Self::Git { .. } => "Git",
            Self::Runtime => "Runtime",
            Self::Url { .. } => "URL",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSource {
    /// `ConfigMap` name, looked up in the namespace of the Agent, template or
    /// Task that declares the context
    pub name: String,

    /// Single key to use; all keys are used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Tolerate a missing `ConfigMap`
    #[serde(default)]
    pub optional: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    /// Repository URL (https:// or git@)
    pub repository: String,

    /// Branch, tag or commit; defaults to HEAD
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,

    /// Clone depth; defaults to 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<i32>,

    /// Sub-directory of the repository to expose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Secret holding `username`/`password` keys for HTTPS auth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UrlSource {
    pub url: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,

    /// Secret holding `token`, or `username`/`password` keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

/// Output parameter requested from the workload
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct OutputParameter {
    pub name: String,

    /// File path, relative to the workspace directory unless absolute
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Declared outputs; serialized as-is into the collector's `OUTPUT_SPEC`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct OutputSpec {
    #[serde(default)]
    pub parameters: Vec<OutputParameter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_item_variants_deserialize() {
        let yaml = r#"
- name: guide
  type: Text
  text: "follow the guide"
- name: settings
  type: ConfigMap
  mountPath: .config/settings.json
  configMap:
    name: agent-settings
    key: settings.json
- type: Git
  mountPath: src
  git:
    repository: https://github.com/example/repo.git
    ref: main
- type: Runtime
- type: URL
  mountPath: docs/api.md
  url:
    url: https://example.com/api.md
    headers:
      Accept: text/plain
"#;
        let items: Vec<ContextItem> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].source.type_name(), "Text");
        assert_eq!(items[1].name.as_deref(), Some("settings"));
        assert!(matches!(
            &items[1].source,
            ContextSource::ConfigMap { config_map } if config_map.name == "agent-settings"
        ));
        assert!(matches!(
            &items[2].source,
            ContextSource::Git { git } if git.git_ref.as_deref() == Some("main")
        ));
        assert_eq!(items[3].source, ContextSource::Runtime);
        match &items[4].source {
            ContextSource::Url { url } => {
                assert_eq!(url.headers.get("Accept").map(String::as_str), Some("text/plain"));
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_unknown_context_type_is_rejected() {
        let yaml = "type: Secret\nname: nope\n";
        assert!(serde_yaml::from_str::<ContextItem>(yaml).is_err());
    }
}
