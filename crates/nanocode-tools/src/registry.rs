//! Static catalog of the built-in tools and their argument contracts.
//!
//! The same descriptors drive argument validation, the function-calling
//! schemas sent to the model, and the tool listing in text-grammar prompts.

use nanocode_core::{FunctionDefinition, ToolDefinition, ToolName};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
}

impl ParamType {
    pub fn json_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamType,
    pub required: bool,
    /// Empty strings are rejected unless this is set.
    pub allow_empty: bool,
    pub default: Option<&'static str>,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
}

impl ParamSpec {
    const fn required(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            allow_empty: false,
            default: None,
            aliases: &[],
            description,
        }
    }

    const fn optional(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    const fn aliases(self, aliases: &'static [&'static str]) -> Self {
        Self { aliases, ..self }
    }

    const fn allow_empty(self) -> Self {
        Self {
            allow_empty: true,
            ..self
        }
    }

    const fn default(self, default: &'static str) -> Self {
        Self {
            default: Some(default),
            ..self
        }
    }

    pub fn matches_key(&self, key: &str) -> bool {
        self.name == key || self.aliases.contains(&key)
    }
}

#[derive(Debug)]
pub struct ToolSpec {
    pub name: ToolName,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
}

impl ToolSpec {
    pub fn param(&self, key: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.matches_key(key))
    }

    /// JSON schema for the `parameters` field of a function definition.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in self.params {
            let mut description = param.description.to_string();
            if let Some(default) = param.default {
                description.push_str(&format!(" (default: {default})"));
            }
            properties.insert(
                param.name.to_string(),
                json!({"type": param.kind.json_type(), "description": description}),
            );
            if param.required {
                required.push(param.name);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name.as_api_name().to_string(),
                description: self.description.to_string(),
                parameters: self.parameters_schema(),
            },
        }
    }

    /// One-line signature such as `read(path, offset?, limit?)`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                if p.required {
                    p.name.to_string()
                } else {
                    format!("{}?", p.name)
                }
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

use ParamType::{Integer, String as Str};

const READ_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("path", Str, "File to read").aliases(&["file_path"]),
    ParamSpec::optional("offset", Integer, "Number of lines to skip").default("0"),
    ParamSpec::optional("limit", Integer, "Maximum number of lines to return"),
];

const WRITE_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("path", Str, "File to create or overwrite").aliases(&["file_path"]),
    ParamSpec::required("content", Str, "Full file content").allow_empty(),
];

const EDIT_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("path", Str, "File to edit").aliases(&["file_path"]),
    ParamSpec::required("old_string", Str, "Exact text to replace; must occur exactly once")
        .aliases(&["old"]),
    ParamSpec::required("new_string", Str, "Replacement text")
        .aliases(&["new"])
        .allow_empty(),
];

const GLOB_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("pattern", Str, "Glob pattern, e.g. **/*.rs").aliases(&["pat"]),
    ParamSpec::optional("path", Str, "Search root").default("."),
];

const GREP_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("pattern", Str, "Regular expression").aliases(&["pat"]),
    ParamSpec::optional("path", Str, "File or directory to search").default("."),
    ParamSpec::optional("include", Str, "Glob filter for file names, e.g. *.py"),
];

const BASH_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("command", Str, "Shell command").aliases(&["cmd"]),
    ParamSpec::optional("timeout", Integer, "Timeout in seconds, at most 600").default("30"),
];

pub static TOOL_SPECS: [ToolSpec; 6] = [
    ToolSpec {
        name: ToolName::Read,
        description: "Read a file with line numbers",
        params: READ_PARAMS,
    },
    ToolSpec {
        name: ToolName::Write,
        description: "Write content to a file, creating parent directories",
        params: WRITE_PARAMS,
    },
    ToolSpec {
        name: ToolName::Edit,
        description: "Replace old_string with new_string in a file; old_string must be unique",
        params: EDIT_PARAMS,
    },
    ToolSpec {
        name: ToolName::Glob,
        description: "Find files by glob pattern, most recently modified first",
        params: GLOB_PARAMS,
    },
    ToolSpec {
        name: ToolName::Grep,
        description: "Search files for a regex, returning file:line:text matches",
        params: GREP_PARAMS,
    },
    ToolSpec {
        name: ToolName::Bash,
        description: "Run a shell command; stdout and stderr are combined",
        params: BASH_PARAMS,
    },
];

pub fn spec_for(tool: ToolName) -> &'static ToolSpec {
    match tool {
        ToolName::Read => &TOOL_SPECS[0],
        ToolName::Write => &TOOL_SPECS[1],
        ToolName::Edit => &TOOL_SPECS[2],
        ToolName::Glob => &TOOL_SPECS[3],
        ToolName::Grep => &TOOL_SPECS[4],
        ToolName::Bash => &TOOL_SPECS[5],
    }
}

/// Case-sensitive lookup by API name.
pub fn lookup(name: &str) -> Option<&'static ToolSpec> {
    ToolName::from_api_name(name).map(spec_for)
}

pub fn tool_names() -> Vec<&'static str> {
    TOOL_SPECS.iter().map(|spec| spec.name.as_api_name()).collect()
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    TOOL_SPECS.iter().map(ToolSpec::definition).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_are_indexed_by_tool_name() {
        for tool in ToolName::ALL {
            assert_eq!(spec_for(tool).name, tool);
        }
    }

    #[test]
    fn lookup_rejects_unknown_names() {
        assert!(lookup("read").is_some());
        assert!(lookup("Read").is_none());
        assert!(lookup("fs.read").is_none());
    }

    #[test]
    fn schema_marks_required_and_maps_integer_types() {
        let schema = spec_for(ToolName::Read).parameters_schema();
        assert_eq!(schema["required"], json!(["path"]));
        assert_eq!(schema["properties"]["offset"]["type"], "integer");
        assert!(
            schema["properties"]["offset"]["description"]
                .as_str()
                .is_some_and(|d| d.contains("default: 0"))
        );
    }

    #[test]
    fn definitions_cover_every_tool_in_order() {
        let names: Vec<String> = tool_definitions()
            .into_iter()
            .map(|d| d.function.name)
            .collect();
        assert_eq!(names, vec!["read", "write", "edit", "glob", "grep", "bash"]);
    }

    #[test]
    fn signature_marks_optional_params() {
        assert_eq!(spec_for(ToolName::Grep).signature(), "grep(pattern, path?, include?)");
    }

    #[test]
    fn aliases_resolve_to_params() {
        let edit = spec_for(ToolName::Edit);
        assert_eq!(edit.param("old").map(|p| p.name), Some("old_string"));
        assert!(edit.param("replace").is_none());
    }
}
