//! Cask manifest parsing and validation.
//!
//! A manifest describes one installable application. Two source shapes are
//! accepted: the cask DSL
//!
//! ```text
//! cask 'hv-kb390l-config' do
//!   version '1.0.0'
//!   sha256 '03e5466ca0c3b0044fc0f76cfb1fd92d419256e526644db4b19c76a5ba377e27'
//!   url "https://github.com/pbludov/hv-kb390l-config/releases/download/v1.0.0/hv-kb390l-config.dmg"
//!   name 'HV KB390L'
//!   homepage 'https://github.com/pbludov/hv-kb390l-config/'
//!   app 'hv-kb390l-config.app'
//! end
//! ```
//!
//! and the JSON document served by the Homebrew cask API. Both go through the
//! same validation, so a [`Manifest`] value always satisfies its invariants.
//!
//! # Examples
//!
//! ```
//! use casket::Manifest;
//!
//! let raw = r#"
//! cask 'demo' do
//!   version '2.1'
//!   sha256 '03e5466ca0c3b0044fc0f76cfb1fd92d419256e526644db4b19c76a5ba377e27'
//!   url 'https://example.com/demo.tar.gz'
//!   name 'Demo'
//!   app 'Demo.app'
//! end
//! "#;
//!
//! let manifest = Manifest::parse(raw).unwrap();
//! assert_eq!(manifest.identifier, "demo");
//! assert_eq!(Manifest::parse(&manifest.to_cask()).unwrap(), manifest);
//! ```

use crate::error::{CasketError, ValidationError};
use crate::verify::DIGEST_HEX_LEN;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

type Result<T> = std::result::Result<T, ValidationError>;

/// Stanzas a cask body may contain, in canonical order.
const STANZAS: &[&str] = &["version", "sha256", "url", "name", "homepage", "app"];

/// URL schemes the fetcher knows how to retrieve.
const SOURCE_SCHEMES: &[&str] = &["http", "https", "file"];

/// A validated cask manifest. Construct with [`Manifest::parse`],
/// [`Manifest::from_json`] or [`Manifest::load`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub identifier: String,
    pub version: String,
    /// Lowercase SHA-256 hex digest of the downloadable artifact
    pub content_hash: String,
    pub source_url: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    pub app_bundle_name: String,
}

/// Cask as served by the Homebrew JSON API (the subset we read)
#[derive(Debug, Deserialize)]
struct ApiCask {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    name: Vec<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    artifacts: Vec<serde_json::Value>,
}

/// Raw field values before validation
#[derive(Default)]
struct Fields {
    identifier: Option<String>,
    version: Option<String>,
    sha256: Option<String>,
    url: Option<String>,
    name: Option<String>,
    homepage: Option<String>,
    app: Option<String>,
}

impl Manifest {
    /// Parse a cask DSL declaration.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut fields = Fields::default();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut closed = false;

        for (idx, line) in raw.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if closed {
                return Err(syntax(line_no, "content after closing `end`"));
            }

            if fields.identifier.is_none() {
                fields.identifier = Some(parse_header(line, line_no)?);
                continue;
            }

            if let Some(rest) = line.strip_prefix("end")
                && (rest.is_empty() || rest.starts_with(char::is_whitespace))
            {
                expect_line_end(rest, line_no)?;
                closed = true;
                continue;
            }

            let (keyword, rest) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| syntax(line_no, "expected `<stanza> '<value>'`"))?;

            let Some(stanza) = STANZAS.iter().find(|s| **s == keyword) else {
                return Err(ValidationError::UnknownField(keyword.to_string()));
            };

            if seen.insert(*stanza, line_no).is_some() {
                return Err(ValidationError::DuplicateField(keyword.to_string()));
            }

            let (value, mut rest) = take_string_literal(rest.trim(), line_no)?;
            if *stanza == "url"
                && let Some(options) = rest.trim_start().strip_prefix(',')
            {
                rest = skip_url_options(options, line_no)?;
            }
            expect_line_end(rest, line_no)?;
            let slot = match *stanza {
                "version" => &mut fields.version,
                "sha256" => &mut fields.sha256,
                "url" => &mut fields.url,
                "name" => &mut fields.name,
                "homepage" => &mut fields.homepage,
                _ => &mut fields.app,
            };
            *slot = Some(value);
        }

        if fields.identifier.is_none() {
            return Err(ValidationError::MissingField("cask".to_string()));
        }
        if !closed {
            return Err(syntax(raw.lines().count(), "missing closing `end`"));
        }

        fields.validate()
    }

    /// Parse a Homebrew cask API document.
    ///
    /// `fallback_identifier` is used when the document carries no `token`.
    pub fn from_json(raw: &str, fallback_identifier: Option<&str>) -> Result<Self> {
        let cask: ApiCask =
            serde_json::from_str(raw).map_err(|e| ValidationError::Json(e.to_string()))?;

        let app = extract_app_artifacts(&cask.artifacts).into_iter().next();

        Fields {
            identifier: cask
                .token
                .or_else(|| fallback_identifier.map(str::to_string)),
            version: cask.version,
            sha256: cask.sha256,
            url: cask.url,
            name: cask.name.into_iter().next(),
            homepage: cask.homepage,
            app,
        }
        .validate()
    }

    /// Read and parse a manifest file. `.json` files use the API shape,
    /// everything else is read as cask DSL.
    pub fn load(path: &Path) -> std::result::Result<Self, CasketError> {
        let raw = std::fs::read_to_string(path)?;
        let stem = path.file_stem().and_then(|s| s.to_str());

        let manifest = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&raw, stem)?,
            _ => Self::parse(&raw)?,
        };

        if let Some(stem) = stem
            && stem != manifest.identifier
        {
            tracing::debug!(
                file = %path.display(),
                identifier = %manifest.identifier,
                "manifest file name differs from its token"
            );
        }

        Ok(manifest)
    }

    /// Render back to cask DSL. Parsing the output yields an equal manifest.
    pub fn to_cask(&self) -> String {
        let mut out = format!("cask {} do\n", quote(&self.identifier));
        out.push_str(&format!("  version {}\n", quote(&self.version)));
        out.push_str(&format!("  sha256 {}\n", quote(&self.content_hash)));
        out.push_str(&format!("  url {}\n", quote(&self.source_url)));
        out.push_str(&format!("  name {}\n", quote(&self.display_name)));
        if let Some(homepage) = &self.homepage {
            out.push_str(&format!("  homepage {}\n", quote(homepage)));
        }
        out.push_str(&format!("  app {}\n", quote(&self.app_bundle_name)));
        out.push_str("end\n");
        out
    }

    /// File name the downloaded artifact is stored under
    pub fn artifact_file_name(&self) -> String {
        Url::parse(&self.source_url)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{}-{}", self.identifier, self.version))
    }
}

impl Fields {
    fn validate(self) -> Result<Manifest> {
        let identifier = required("cask", self.identifier)?;
        validate_identifier(&identifier)?;

        let version = required("version", self.version)?;
        if version.contains(['/', '\\']) || version.starts_with('.') {
            return Err(invalid("version", "must not be a path or start with `.`"));
        }
        let content_hash = validate_hash("sha256", &required("sha256", self.sha256)?)?;
        let source_url = required("url", self.url)?;
        validate_uri("url", &source_url, SOURCE_SCHEMES)?;
        let display_name = required("name", self.name)?;

        let homepage = match self.homepage.filter(|h| !h.trim().is_empty()) {
            Some(homepage) => {
                validate_uri("homepage", &homepage, &["http", "https"])?;
                Some(homepage)
            }
            None => None,
        };

        let app_bundle_name = required("app", self.app)?;
        if app_bundle_name.contains(['/', '\\']) || app_bundle_name == "." || app_bundle_name == ".." {
            return Err(invalid("app", "must be a bundle name, not a path"));
        }

        for (field, value) in [
            ("cask", &identifier),
            ("version", &version),
            ("url", &source_url),
            ("name", &display_name),
            ("app", &app_bundle_name),
        ]
        .into_iter()
        .chain(homepage.as_ref().map(|h| ("homepage", h)))
        {
            if value.chars().any(char::is_control) {
                return Err(invalid(field, "must not contain control characters"));
            }
        }

        Ok(Manifest {
            identifier,
            version,
            content_hash,
            source_url,
            display_name,
            homepage,
            app_bundle_name,
        })
    }
}

/// Extract app artifact names from cask API JSON
fn extract_app_artifacts(artifacts: &[serde_json::Value]) -> Vec<String> {
    let mut apps = Vec::new();

    for artifact in artifacts {
        if let Some(obj) = artifact.as_object()
            && let Some(app_array) = obj.get("app")
            && let Some(arr) = app_array.as_array()
        {
            for item in arr {
                if let Some(app_name) = item.as_str() {
                    apps.push(app_name.to_string());
                }
            }
        }
    }

    apps
}

/// Check a cask token, as given in a manifest or on the command line.
/// Tokens name ledger files and Caskroom directories, so they cannot be paths.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(ValidationError::MissingField("cask".to_string()));
    }
    if identifier.contains(['/', '\\'])
        || identifier.starts_with('.')
        || identifier.chars().any(char::is_control)
    {
        return Err(invalid("cask", "token must not be a path"));
    }
    Ok(())
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field.to_string())),
    }
}

fn validate_hash(field: &str, value: &str) -> Result<String> {
    if value.len() != DIGEST_HEX_LEN || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::MalformedHash(field.to_string()));
    }
    Ok(value.to_ascii_lowercase())
}

fn validate_uri(field: &str, value: &str, schemes: &[&str]) -> Result<()> {
    let url = Url::parse(value).map_err(|_| ValidationError::MalformedUri(field.to_string()))?;

    if !schemes.contains(&url.scheme()) {
        return Err(ValidationError::MalformedUri(field.to_string()));
    }
    if url.scheme() != "file" && url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::MalformedUri(field.to_string()));
    }

    Ok(())
}

/// `cask 'token' do`
fn parse_header(line: &str, line_no: usize) -> Result<String> {
    let header_error = || syntax(line_no, "expected `cask '<token>' do`");
    let body = line
        .strip_prefix("cask")
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .ok_or_else(header_error)?;

    let (token, rest) = take_string_literal(body.trim_start(), line_no)?;
    let rest = rest.trim_start().strip_prefix("do").ok_or_else(header_error)?;
    expect_line_end(rest, line_no)?;
    Ok(token)
}

/// A single- or double-quoted literal at the start of `input`, and the text
/// after it. Single quotes only recognize `\\` and `\'`, as in Ruby.
fn take_string_literal(input: &str, line_no: usize) -> Result<(String, &str)> {
    let mut chars = input.char_indices();
    let quote = match chars.next() {
        Some((_, q @ ('\'' | '"'))) => q,
        _ => return Err(syntax(line_no, "expected a quoted string")),
    };

    let mut value = String::new();
    let mut escaped = false;

    for (idx, c) in chars {
        if escaped {
            match (quote, c) {
                ('\'', '\\' | '\'') => value.push(c),
                ('\'', _) => {
                    value.push('\\');
                    value.push(c);
                }
                (_, 'n') => value.push('\n'),
                (_, 't') => value.push('\t'),
                (_, 'r') => value.push('\r'),
                _ => value.push(c),
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Ok((value, &input[idx + c.len_utf8()..]));
        } else {
            value.push(c);
        }
    }

    Err(syntax(line_no, "unterminated string"))
}

/// Nothing but whitespace or a `#` comment may follow a stanza.
fn expect_line_end(rest: &str, line_no: usize) -> Result<()> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        Err(syntax(line_no, "unexpected text after string"))
    }
}

/// `verified: '...'` and similar download hints after a `url`. They do not
/// change what is fetched, so their values are dropped.
fn skip_url_options(mut input: &str, line_no: usize) -> Result<&str> {
    loop {
        let (key, value) = input
            .trim_start()
            .split_once(':')
            .filter(|(key, _)| {
                !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            })
            .ok_or_else(|| syntax(line_no, "expected `<option>: '<value>'` after url"))?;

        let (_, rest) = take_string_literal(value.trim_start(), line_no)?;
        tracing::debug!(option = key, "ignoring url option");

        match rest.trim_start().strip_prefix(',') {
            Some(more) => input = more,
            None => return Ok(rest),
        }
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn syntax(line: usize, reason: &str) -> ValidationError {
    ValidationError::Syntax {
        line,
        reason: reason.to_string(),
    }
}
