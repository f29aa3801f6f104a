//! Input validation: source/addons locations, transport policy, URL probing,
//! and addon manifest structure.
//!
//! Odoo modules declare themselves with a `__manifest__.py` (or the legacy
//! `__openerp__.py`) holding a Python dictionary literal. We do not evaluate
//! Python; the fields the upgrade cares about (`name`, `version`, `depends`)
//! are located structurally with quote- and bracket-aware scanning and held
//! to the same acceptance rules the upgrade tooling expects.

use crate::error::{self, Result};
use crate::version::OdooVersion;
use log::warn;
use regex::Regex;
use snafu::{ensure, IntoError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use walkdir::WalkDir;

pub(crate) const SOURCE_EXTENSIONS: &[&str] = &[".zip", ".dump"];
pub(crate) const ADDONS_ZIP_EXTENSION: &str = ".zip";
pub(crate) const MANIFEST_FILES: &[&str] = &["__manifest__.py", "__openerp__.py"];

/// Classifies a location string as a web URL.
pub(crate) fn is_url(location: &str) -> bool {
    match Url::parse(location) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// The lowercase extension of a location, with its leading dot; empty when
/// there is none. URLs are judged by their path component.
pub(crate) fn location_extension(location: &str) -> String {
    let path = if is_url(location) {
        match Url::parse(location) {
            Ok(url) => url.path().to_string(),
            Err(_) => location.to_string(),
        }
    } else {
        location.to_string()
    };

    Path::new(&path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

#[derive(Debug)]
pub(crate) struct Validator {
    allow_insecure_http: bool,
    probe_timeout: Duration,
}

impl Validator {
    pub(crate) fn new(allow_insecure_http: bool, probe_timeout: Duration) -> Self {
        Self {
            allow_insecure_http,
            probe_timeout,
        }
    }

    pub(crate) fn ensure_supported_source_extension(&self, location: &str) -> Result<()> {
        let ext = location_extension(location);
        ensure!(
            SOURCE_EXTENSIONS.contains(&ext.as_str()),
            error::InvalidSourceFormatSnafu
        );
        Ok(())
    }

    pub(crate) fn ensure_supported_addons_extension(&self, location: &str) -> Result<()> {
        ensure!(
            location_extension(location) == ADDONS_ZIP_EXTENSION,
            error::InvalidAddonsFormatSnafu
        );
        Ok(())
    }

    /// Rejects plaintext HTTP unless the operator opted in, in which case a
    /// warning is emitted instead.
    pub(crate) fn enforce_transport_policy(&self, location: &str, label: &str) -> Result<()> {
        if !is_url(location) {
            return Ok(());
        }

        let scheme = Url::parse(location)
            .map(|u| u.scheme().to_string())
            .unwrap_or_default();
        if scheme == "http" {
            ensure!(
                self.allow_insecure_http,
                error::InsecureHttpSnafu { label }
            );
            warn!(
                "Insecure HTTP enabled for {}: {}. Prefer HTTPS whenever possible.",
                label, location
            );
        }
        Ok(())
    }

    /// Checks that a remote location answers, following redirects. HEAD is
    /// tried first since some hosts reject it; GET is the fallback.
    pub(crate) fn probe_url(&self, location: &str, label: &str) -> Result<()> {
        self.enforce_transport_policy(location, label)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(self.probe_timeout)
            .build()
            .map_err(|source| error::HttpClientSnafu.into_error(source))?;

        let mut last_error = String::new();
        for method in [reqwest::Method::HEAD, reqwest::Method::GET] {
            match client.request(method, location).send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    last_error = format!("server returned {}", status);
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        error::ProbeFailedSnafu {
            label,
            message: last_error,
        }
        .fail()
    }

    /// Early strict validation of the source and (optionally) addons inputs,
    /// before anything is downloaded or any container started.
    pub(crate) fn validate_source_accessibility(
        &self,
        source: &str,
        extra_addons: Option<&str>,
        target: &OdooVersion,
    ) -> Result<()> {
        self.ensure_supported_source_extension(source)?;

        if is_url(source) {
            self.probe_url(source, "source URL")?;
        } else {
            let path = Path::new(source);
            ensure!(path.exists(), error::SourceNotFoundSnafu { path });
            ensure!(path.is_file(), error::SourceNotFileSnafu { path });
        }

        let extra_addons = match extra_addons {
            Some(location) => location,
            None => return Ok(()),
        };

        if is_url(extra_addons) {
            self.ensure_supported_addons_extension(extra_addons)?;
            self.probe_url(extra_addons, "extra addons URL")?;
            return Ok(());
        }

        let addons_path = Path::new(extra_addons);
        ensure!(
            addons_path.exists(),
            error::AddonsNotFoundSnafu { path: addons_path }
        );

        if addons_path.is_dir() {
            return self.validate_addons_tree(addons_path, target);
        }

        if addons_path.is_file() {
            return self.ensure_supported_addons_extension(extra_addons);
        }

        error::InvalidAddonsSourceSnafu.fail()
    }

    /// Requires at least one module in the tree and validates every manifest.
    pub(crate) fn validate_addons_tree(&self, addons_path: &Path, target: &OdooVersion) -> Result<()> {
        ensure!(
            addons_path.is_dir(),
            error::AddonsNotFoundSnafu { path: addons_path }
        );

        let module_dirs = discover_module_dirs(addons_path);
        ensure!(
            !module_dirs.is_empty(),
            error::NoModulesFoundSnafu { path: addons_path }
        );

        for module_dir in module_dirs {
            validate_manifest(&module_dir, target)?;
        }
        Ok(())
    }
}

/// True when `path` directly contains a module manifest file.
pub(crate) fn is_module_dir(path: &Path) -> bool {
    MANIFEST_FILES
        .iter()
        .any(|name| path.join(name).is_file())
}

/// Finds every module directory under `addons_path` (including the root
/// itself), skipping hidden directories and Python bytecode caches. The
/// result is sorted and de-duplicated.
pub(crate) fn discover_module_dirs(addons_path: &Path) -> Vec<PathBuf> {
    let mut discovered = BTreeSet::new();

    if is_module_dir(addons_path) {
        discovered.insert(addons_path.to_path_buf());
    }

    for entry in WalkDir::new(addons_path)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if !MANIFEST_FILES.iter().any(|name| file_name == *name) {
            continue;
        }
        // Hidden and bytecode-cache directories are judged relative to the
        // addons root, so a dot-named scratch root does not hide everything.
        let relative = entry
            .path()
            .strip_prefix(addons_path)
            .expect("walkdir yields paths under its root");
        if relative
            .components()
            .any(|c| is_hidden_or_cache_component(c.as_os_str().to_string_lossy().as_ref()))
        {
            continue;
        }
        if let Some(parent) = entry.path().parent() {
            discovered.insert(parent.to_path_buf());
        }
    }

    discovered.into_iter().collect()
}

fn is_hidden_or_cache_component(name: &str) -> bool {
    name.starts_with('.') || name == "__pycache__"
}

/// Validates the manifest of a single module directory against the target
/// version's compatibility rules.
pub(crate) fn validate_manifest(module_dir: &Path, target: &OdooVersion) -> Result<()> {
    let manifest_path = MANIFEST_FILES
        .iter()
        .map(|name| module_dir.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            error::ManifestMissingSnafu {
                module: module_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| module_dir.display().to_string()),
            }
            .build()
        })?;

    let text = std::fs::read_to_string(&manifest_path).map_err(|source| {
        error::ManifestReadSnafu { path: &manifest_path }.into_error(source)
    })?;

    check_manifest_text(&text, &manifest_path, target)
}

fn check_manifest_text(text: &str, path: &Path, target: &OdooVersion) -> Result<()> {
    ensure!(
        looks_like_dict_literal(text),
        error::ManifestSyntaxSnafu { path }
    );

    match extract_string_field(text, "name") {
        Field::Present(name) if !name.trim().is_empty() => {}
        _ => return error::ManifestNameSnafu { path }.fail(),
    }

    match extract_depends(text) {
        Depends::Missing => {}
        Depends::List(depends) => {
            ensure!(
                depends.iter().all(|d| !d.trim().is_empty()),
                error::ManifestDependsSnafu { path }
            );
        }
        Depends::Invalid => return error::ManifestDependsSnafu { path }.fail(),
    }

    match extract_string_field(text, "version") {
        Field::Missing => Ok(()),
        Field::NotAString => error::ManifestVersionValueSnafu { path }.fail(),
        Field::Present(version) => check_manifest_version(&version, path, target),
    }
}

fn check_manifest_version(version: &str, path: &Path, target: &OdooVersion) -> Result<()> {
    let clean = version.trim();
    if clean.is_empty() {
        return Ok(());
    }

    let shape = Regex::new(r"^\d+\.\d+(?:\.\d+){0,3}$").expect("static regex");
    ensure!(
        shape.is_match(clean),
        error::ManifestVersionFormatSnafu {
            path,
            version,
            target: target.to_string(),
        }
    );

    let parts: Vec<&str> = clean.split('.').collect();
    if parts.len() >= 4 {
        let matches_target = parts[0] == target.major.to_string()
            && parts[1] == target.minor.to_string();
        ensure!(
            matches_target,
            error::ManifestVersionMismatchSnafu {
                path,
                version,
                target: target.to_string(),
            }
        );
    }
    Ok(())
}

/// A manifest must be one top-level dictionary literal. Leading comment
/// lines (coding declarations, license headers) are tolerated.
fn looks_like_dict_literal(text: &str) -> bool {
    let meaningful: String = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = meaningful.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

enum Field {
    Missing,
    NotAString,
    Present(String),
}

/// Locates `'key':` at the top level of the literal and reads its value when
/// it is a quoted string.
fn extract_string_field(text: &str, key: &str) -> Field {
    let pattern = Regex::new(&format!(r#"['"]{}['"]\s*:\s*"#, regex::escape(key)))
        .expect("static regex");
    let m = match pattern.find(text) {
        Some(m) => m,
        None => return Field::Missing,
    };

    let rest = &text[m.end()..];
    let mut chars = rest.chars();
    match chars.next() {
        Some(quote @ ('\'' | '"')) => {
            let mut value = String::new();
            for c in chars {
                if c == quote {
                    return Field::Present(value);
                }
                value.push(c);
            }
            Field::NotAString
        }
        _ => Field::NotAString,
    }
}

enum Depends {
    Missing,
    Invalid,
    List(Vec<String>),
}

/// Reads the `depends` entry, which must be a list (or tuple) of strings.
fn extract_depends(text: &str) -> Depends {
    let pattern = Regex::new(r#"['"]depends['"]\s*:\s*"#).expect("static regex");
    let m = match pattern.find(text) {
        Some(m) => m,
        None => return Depends::Missing,
    };

    let rest = &text[m.end()..];
    let mut chars = rest.chars();
    let close = match chars.next() {
        Some('[') => ']',
        Some('(') => ')',
        _ => return Depends::Invalid,
    };

    let mut items = Vec::new();
    let mut current: Option<(char, String)> = None;
    let mut in_comment = false;
    for c in chars {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        match current.take() {
            Some((quote, mut value)) => {
                if c == quote {
                    items.push(value);
                } else {
                    value.push(c);
                    current = Some((quote, value));
                }
            }
            None => match c {
                '\'' | '"' => current = Some((c, String::new())),
                ',' | ' ' | '\t' | '\n' | '\r' => {}
                '#' => in_comment = true,
                c if c == close => return Depends::List(items),
                _ => return Depends::Invalid,
            },
        }
    }

    // Ran out of input before the list closed.
    Depends::Invalid
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn target() -> OdooVersion {
        "16.0".parse().unwrap()
    }

    fn write_module(root: &Path, name: &str, manifest: &str) -> PathBuf {
        let module = root.join(name);
        fs::create_dir_all(&module).unwrap();
        fs::write(module.join("__manifest__.py"), manifest).unwrap();
        module
    }

    #[test]
    fn url_classification() {
        assert!(is_url("https://example.com/db.zip"));
        assert!(is_url("http://example.com/db.zip"));
        assert!(!is_url("/tmp/db.zip"));
        assert!(!is_url("db.zip"));
    }

    #[test]
    fn extension_extraction() {
        assert_eq!(location_extension("/tmp/db.ZIP"), ".zip");
        assert_eq!(location_extension("https://h/x/db.dump?sig=abc"), ".dump");
        assert_eq!(location_extension("/tmp/no_extension"), "");
    }

    #[test]
    fn source_extension_policy() {
        let v = Validator::new(false, Duration::from_secs(5));
        v.ensure_supported_source_extension("/tmp/a.zip").unwrap();
        v.ensure_supported_source_extension("/tmp/a.dump").unwrap();
        assert!(matches!(
            v.ensure_supported_source_extension("/tmp/a.sql").unwrap_err(),
            crate::error::Error::InvalidSourceFormat
        ));
    }

    #[test]
    fn plaintext_http_refused_without_opt_in() {
        let v = Validator::new(false, Duration::from_secs(5));
        let err = v
            .enforce_transport_policy("http://example.com/db.zip", "source URL")
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::InsecureHttp { .. }));
    }

    #[test]
    fn plaintext_http_allowed_with_opt_in() {
        let v = Validator::new(true, Duration::from_secs(5));
        v.enforce_transport_policy("http://example.com/db.zip", "source URL")
            .unwrap();
    }

    #[test]
    fn probe_falls_back_from_head_to_get() {
        use httptest::{matchers::*, responders::*, Expectation, Server};

        // A host that rejects HEAD must still pass via GET.
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/db.zip"))
                .respond_with(status_code(405)),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/db.zip"))
                .respond_with(status_code(200)),
        );

        let v = Validator::new(true, Duration::from_secs(5));
        v.probe_url(&server.url_str("/db.zip"), "source URL").unwrap();
    }

    #[test]
    fn probe_reports_unreachable_locations() {
        use httptest::{matchers::*, responders::*, Expectation, Server};

        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/gone.zip"))
                .respond_with(status_code(404)),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/gone.zip"))
                .respond_with(status_code(404)),
        );

        let v = Validator::new(true, Duration::from_secs(5));
        let err = v
            .probe_url(&server.url_str("/gone.zip"), "source URL")
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::ProbeFailed { .. }));
    }

    #[test]
    fn missing_local_source_is_reported() {
        let v = Validator::new(false, Duration::from_secs(5));
        let err = v
            .validate_source_accessibility("/no/such/file.zip", None, &target())
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::SourceNotFound { .. }));
    }

    #[test]
    fn discovers_modules_and_skips_hidden_dirs() {
        let dir = TempDir::new().unwrap();
        write_module(dir.path(), "mod_a", "{'name': 'A'}");
        write_module(dir.path(), "nested/mod_b", "{'name': 'B'}");
        write_module(dir.path(), ".git/mod_c", "{'name': 'C'}");
        write_module(dir.path(), "__pycache__/mod_d", "{'name': 'D'}");

        let dirs = discover_module_dirs(dir.path());
        let names: Vec<String> = dirs
            .iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["mod_a", "nested/mod_b"]);
    }

    #[test]
    fn empty_tree_is_rejected() {
        let dir = TempDir::new().unwrap();
        let v = Validator::new(false, Duration::from_secs(5));
        let err = v
            .validate_addons_tree(dir.path(), &target())
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::NoModulesFound { .. }));
    }

    #[test]
    fn valid_manifest_passes() {
        let dir = TempDir::new().unwrap();
        let module = write_module(
            dir.path(),
            "good",
            r#"# -*- coding: utf-8 -*-
{
    'name': 'Good Module',
    'version': '16.0.1.0.0',
    'depends': ['base', 'web'],
}
"#,
        );
        validate_manifest(&module, &target()).unwrap();
    }

    #[test]
    fn manifest_must_be_a_dict() {
        let dir = TempDir::new().unwrap();
        let module = write_module(dir.path(), "bad", "name = 'nope'");
        let err = validate_manifest(&module, &target()).unwrap_err();
        assert!(matches!(err, crate::error::Error::ManifestSyntax { .. }));
    }

    #[test]
    fn manifest_requires_nonempty_name() {
        let dir = TempDir::new().unwrap();
        let module = write_module(dir.path(), "noname", "{'version': '1.0'}");
        let err = validate_manifest(&module, &target()).unwrap_err();
        assert!(matches!(err, crate::error::Error::ManifestName { .. }));

        let module = write_module(dir.path(), "blank", "{'name': '  '}");
        let err = validate_manifest(&module, &target()).unwrap_err();
        assert!(matches!(err, crate::error::Error::ManifestName { .. }));
    }

    #[test]
    fn depends_must_be_a_list_of_strings() {
        let dir = TempDir::new().unwrap();
        let module = write_module(
            dir.path(),
            "numeric_dep",
            "{'name': 'X', 'depends': [1, 2]}",
        );
        let err = validate_manifest(&module, &target()).unwrap_err();
        assert!(matches!(err, crate::error::Error::ManifestDepends { .. }));

        let module = write_module(
            dir.path(),
            "scalar_dep",
            "{'name': 'X', 'depends': 'base'}",
        );
        let err = validate_manifest(&module, &target()).unwrap_err();
        assert!(matches!(err, crate::error::Error::ManifestDepends { .. }));
    }

    #[test]
    fn tuple_depends_is_accepted() {
        let dir = TempDir::new().unwrap();
        let module = write_module(
            dir.path(),
            "tuple_dep",
            "{'name': 'X', 'depends': ('base', 'web')}",
        );
        validate_manifest(&module, &target()).unwrap();
    }

    #[test]
    fn short_versions_pass_regardless_of_target() {
        let dir = TempDir::new().unwrap();
        let module = write_module(dir.path(), "short", "{'name': 'X', 'version': '1.0'}");
        validate_manifest(&module, &target()).unwrap();
    }

    #[test]
    fn long_versions_must_match_target_prefix() {
        let dir = TempDir::new().unwrap();
        let module = write_module(
            dir.path(),
            "wrong_target",
            "{'name': 'X', 'version': '15.0.1.0.0'}",
        );
        let err = validate_manifest(&module, &target()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::ManifestVersionMismatch { .. }
        ));
    }

    #[test]
    fn malformed_versions_are_rejected() {
        let dir = TempDir::new().unwrap();
        let module = write_module(
            dir.path(),
            "weird",
            "{'name': 'X', 'version': '16.0.x'}",
        );
        let err = validate_manifest(&module, &target()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::ManifestVersionFormat { .. }
        ));
    }
}
