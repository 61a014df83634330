//! Per-language command templates
//!
//! A template is a whitespace-separated list of tokens. Tokens may embed
//! placeholders such as `{source}`; any brace that does not form a declared
//! placeholder is a parse error, so a template can never smuggle shell syntax
//! through a gap between placeholders.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Quote `value` for a POSIX shell. Values made only of `[A-Za-z0-9_./-]`
/// pass through unchanged.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'));
    if plain {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', "'\\''")))
    }
}

/// A value the engine substitutes into a template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Absolute path of the code file inside the sandbox
    Source,
    /// Code file name
    File,
    /// Code file name without extension
    Stem,
    /// Writable, executable build directory inside the sandbox
    Build,
    /// Step id
    Step,
    /// Project id
    Project,
}

impl Placeholder {
    /// All declared placeholders
    pub const ALL: [Placeholder; 6] = [
        Placeholder::Source,
        Placeholder::File,
        Placeholder::Stem,
        Placeholder::Build,
        Placeholder::Step,
        Placeholder::Project,
    ];

    fn name(self) -> &'static str {
        match self {
            Placeholder::Source => "source",
            Placeholder::File => "file",
            Placeholder::Stem => "stem",
            Placeholder::Build => "build",
            Placeholder::Step => "step",
            Placeholder::Project => "project",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Placeholder::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// Values substituted into a template
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub source: String,
    pub file: String,
    pub stem: String,
    pub build: String,
    pub step: String,
    pub project: String,
}

impl TemplateContext {
    fn value(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::Source => &self.source,
            Placeholder::File => &self.file,
            Placeholder::Stem => &self.stem,
            Placeholder::Build => &self.build,
            Placeholder::Step => &self.step,
            Placeholder::Project => &self.project,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(Placeholder),
}

/// One parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    tokens: Vec<Vec<Segment>>,
}

impl Template {
    /// Parse a template string
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let tokens = raw
            .split_whitespace()
            .map(parse_token)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if tokens.is_empty() {
            return Err("empty command template".to_string());
        }

        Ok(Template {
            raw: raw.to_string(),
            tokens,
        })
    }

    /// Template text as written in the policy
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Placeholders this template references
    pub fn placeholders(&self) -> Vec<Placeholder> {
        self.tokens
            .iter()
            .flatten()
            .filter_map(|segment| match segment {
                Segment::Value(p) => Some(*p),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Substitute the context into the template. Substituted values are
    /// shell-quoted; literals are taken as written.
    pub fn render(&self, ctx: &TemplateContext) -> String {
        self.tokens
            .iter()
            .map(|token| {
                token
                    .iter()
                    .map(|segment| match segment {
                        Segment::Literal(text) => Cow::Borrowed(text.as_str()),
                        Segment::Value(p) => shell_quote(ctx.value(*p)),
                    })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn parse_token(token: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut rest = token;

    while !rest.is_empty() {
        match rest.find(['{', '}']) {
            None => {
                segments.push(Segment::Literal(rest.to_string()));
                break;
            }
            Some(pos) => {
                if rest[pos..].starts_with('}') {
                    return Err(format!("unmatched '}}' in '{}'", token));
                }
                if pos > 0 {
                    segments.push(Segment::Literal(rest[..pos].to_string()));
                }
                let after = &rest[pos + 1..];
                let end = after
                    .find('}')
                    .ok_or_else(|| format!("unterminated placeholder in '{}'", token))?;
                let name = &after[..end];
                let placeholder = Placeholder::parse(name).ok_or_else(|| {
                    format!("unknown placeholder '{{{}}}' in '{}'", name, token)
                })?;
                segments.push(Segment::Value(placeholder));
                rest = &after[end + 1..];
            }
        }
    }

    Ok(segments)
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// How a language is run: one invocation, or compile then run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCommandTemplate", into = "RawCommandTemplate")]
pub enum CommandTemplate {
    /// Interpreted languages
    Single { run: Template },
    /// Compiled languages
    TwoStage { compile: Template, run: Template },
}

impl CommandTemplate {
    /// Build a single-stage template
    pub fn single(run: &str) -> std::result::Result<Self, String> {
        Ok(CommandTemplate::Single {
            run: Template::parse(run)?,
        })
    }

    /// Build a compile-then-run template
    pub fn two_stage(compile: &str, run: &str) -> std::result::Result<Self, String> {
        Ok(CommandTemplate::TwoStage {
            compile: Template::parse(compile)?,
            run: Template::parse(run)?,
        })
    }

    /// The compile stage, if any
    pub fn compile(&self) -> Option<&Template> {
        match self {
            CommandTemplate::Single { .. } => None,
            CommandTemplate::TwoStage { compile, .. } => Some(compile),
        }
    }

    /// The run stage
    pub fn run(&self) -> &Template {
        match self {
            CommandTemplate::Single { run } | CommandTemplate::TwoStage { run, .. } => run,
        }
    }
}

/// Serialized form: `"python3 {source}"` or `{ "compile": "...", "run": "..." }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawCommandTemplate {
    Line(String),
    Stages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compile: Option<String>,
        run: String,
    },
}

impl TryFrom<RawCommandTemplate> for CommandTemplate {
    type Error = String;

    fn try_from(raw: RawCommandTemplate) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawCommandTemplate::Line(run) => CommandTemplate::single(&run),
            RawCommandTemplate::Stages { compile: None, run } => CommandTemplate::single(&run),
            RawCommandTemplate::Stages {
                compile: Some(compile),
                run,
            } => CommandTemplate::two_stage(&compile, &run),
        }
    }
}

impl From<CommandTemplate> for RawCommandTemplate {
    fn from(template: CommandTemplate) -> Self {
        match template {
            CommandTemplate::Single { run } => RawCommandTemplate::Line(run.raw),
            CommandTemplate::TwoStage { compile, run } => RawCommandTemplate::Stages {
                compile: Some(compile.raw),
                run: run.raw,
            },
        }
    }
}
