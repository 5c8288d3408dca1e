//! Package manifest loading and validation.
//!
//! A manifest is a TOML (or JSON) document listing every package of a build
//! run. Loading is pure: the file is read, parsed and validated, nothing else.
//!
//! ```toml
//! phase_groups = ["toolchain-pass1", "temporary-tools"]
//!
//! [[package]]
//! name = "binutils"
//! version = "2.42"
//! source = "sources/binutils-2.42.tar.xz"
//! checksum = "sha256:…"
//! dependencies = []
//! phases = ["prepare", "configure", "build", "install"]
//! group = "toolchain-pass1"
//! timeouts = { build = 3600 }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use buildseq_state::Phase;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ManifestError;
use crate::executor::FALLBACK_SCRIPT_DIR;

/// Serialization of a manifest file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Toml,
    Json,
}

impl ManifestFormat {
    /// Pick the format from the file extension; TOML unless it says `.json`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ManifestFormat::Json,
            _ => ManifestFormat::Toml,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    phase_groups: Vec<String>,
    #[serde(rename = "package", alias = "packages", default)]
    packages: Vec<RawPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPackage {
    name: String,
    version: String,
    source: String,
    checksum: String,
    dependencies: Vec<String>,
    phases: Option<Vec<String>>,
    group: Option<String>,
    #[serde(default)]
    timeouts: BTreeMap<String, u64>,
}

/// A package declared in the manifest. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
    /// Source locator: a path or URI, resolved by the build action.
    pub source: String,
    /// Lowercase SHA-256 hex digest of the source, without prefix.
    pub checksum: String,
    /// Declared dependencies, in manifest order.
    pub dependencies: Vec<String>,
    /// Phases this package executes, in order.
    pub phases: Vec<Phase>,
    pub group: Option<String>,
    /// Per-phase maximum durations declared by the manifest.
    pub timeouts: BTreeMap<Phase, Duration>,
}

impl Package {
    /// `name-version`, used for work directory names and display.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn runs_phase(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

/// A validated manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    packages: Vec<Package>,
    index: BTreeMap<String, usize>,
    phase_groups: Vec<String>,
    digest: String,
    path: Option<PathBuf>,
}

impl Manifest {
    /// Read and validate the manifest at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest = Self::parse(&content, ManifestFormat::from_path(path))?;
        manifest.path = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// Parse and validate manifest text.
    pub fn parse(content: &str, format: ManifestFormat) -> Result<Self, ManifestError> {
        let raw: RawManifest = match format {
            ManifestFormat::Toml => {
                toml::from_str(content).map_err(|e| ManifestError::malformed(e.to_string()))?
            }
            ManifestFormat::Json => serde_json::from_str(content)
                .map_err(|e| ManifestError::malformed(e.to_string()))?,
        };
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        validate(raw, digest)
    }

    /// Packages in declaration order.
    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn get(&self, name: &str) -> Option<&Package> {
        self.index.get(name).map(|&i| &self.packages[i])
    }

    /// Declared phase groups, in order. Empty when the manifest declares none.
    pub fn phase_groups(&self) -> &[String] {
        &self.phase_groups
    }

    /// SHA-256 hex digest of the manifest text.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// File the manifest was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

fn validate(raw: RawManifest, digest: String) -> Result<Manifest, ManifestError> {
    if raw.packages.is_empty() {
        return Err(ManifestError::malformed("manifest declares no packages"));
    }

    let mut groups = HashSet::new();
    for group in &raw.phase_groups {
        if group.trim().is_empty() {
            return Err(ManifestError::malformed("phase group names must not be empty"));
        }
        if !groups.insert(group.as_str()) {
            return Err(ManifestError::malformed(format!(
                "phase group '{group}' is declared twice"
            )));
        }
    }

    let mut index = BTreeMap::new();
    for (i, pkg) in raw.packages.iter().enumerate() {
        if pkg.name.trim().is_empty() {
            return Err(ManifestError::malformed(format!(
                "package #{} has an empty name",
                i + 1
            )));
        }
        if let Some(problem) = path_component_problem(&pkg.name) {
            return Err(ManifestError::malformed(format!(
                "package name '{}' {problem}",
                pkg.name
            )));
        }
        if pkg.name == FALLBACK_SCRIPT_DIR {
            return Err(ManifestError::malformed(format!(
                "package name '{FALLBACK_SCRIPT_DIR}' is reserved for fallback scripts"
            )));
        }
        if index.insert(pkg.name.clone(), i).is_some() {
            return Err(ManifestError::DuplicatePackage {
                name: pkg.name.clone(),
            });
        }
    }

    let mut packages = Vec::with_capacity(raw.packages.len());
    for raw_pkg in raw.packages {
        packages.push(validate_package(raw_pkg, &groups, &index)?);
    }

    Ok(Manifest {
        packages,
        index,
        phase_groups: raw.phase_groups,
        digest,
        path: None,
    })
}

fn validate_package(
    raw: RawPackage,
    groups: &HashSet<&str>,
    index: &BTreeMap<String, usize>,
) -> Result<Package, ManifestError> {
    let name = raw.name;
    if raw.version.trim().is_empty() {
        return Err(ManifestError::malformed(format!(
            "package '{name}' has an empty version"
        )));
    }
    if raw.source.trim().is_empty() {
        return Err(ManifestError::malformed(format!(
            "package '{name}' has an empty source"
        )));
    }
    if let Some(problem) = path_component_problem(&raw.version) {
        return Err(ManifestError::malformed(format!(
            "package '{name}' version '{}' {problem}",
            raw.version
        )));
    }
    let checksum = parse_checksum(&raw.checksum).ok_or_else(|| {
        ManifestError::malformed(format!(
            "package '{name}' checksum '{}' is not a sha256 hex digest",
            raw.checksum
        ))
    })?;

    let phases = match raw.phases {
        None => Phase::STANDARD.to_vec(),
        Some(list) => {
            if list.is_empty() {
                return Err(ManifestError::malformed(format!(
                    "package '{name}' declares an empty phase list"
                )));
            }
            let mut seen = BTreeSet::new();
            let mut phases = Vec::with_capacity(list.len());
            for p in list {
                let phase: Phase = p
                    .parse()
                    .map_err(|e| ManifestError::malformed(format!("package '{name}': {e}")))?;
                if !seen.insert(phase) {
                    return Err(ManifestError::malformed(format!(
                        "package '{name}' lists phase '{phase}' twice"
                    )));
                }
                phases.push(phase);
            }
            phases
        }
    };

    if let Some(group) = &raw.group {
        if !groups.contains(group.as_str()) {
            return Err(ManifestError::malformed(format!(
                "package '{name}' belongs to undeclared phase group '{group}'"
            )));
        }
    }

    let mut timeouts = BTreeMap::new();
    for (phase_name, secs) in raw.timeouts {
        let phase: Phase = phase_name
            .parse()
            .map_err(|e| ManifestError::malformed(format!("package '{name}' timeouts: {e}")))?;
        if !phases.contains(&phase) {
            return Err(ManifestError::malformed(format!(
                "package '{name}' sets a timeout for phase '{phase}' it does not run"
            )));
        }
        if secs == 0 {
            return Err(ManifestError::malformed(format!(
                "package '{name}' timeout for '{phase}' must be positive"
            )));
        }
        timeouts.insert(phase, Duration::from_secs(secs));
    }

    let mut seen_deps = HashSet::new();
    for dep in &raw.dependencies {
        if !seen_deps.insert(dep.as_str()) {
            return Err(ManifestError::malformed(format!(
                "package '{name}' lists dependency '{dep}' twice"
            )));
        }
        if !index.contains_key(dep) {
            return Err(ManifestError::UnknownDependency {
                package: name.clone(),
                dependency: dep.clone(),
            });
        }
    }

    Ok(Package {
        name,
        version: raw.version,
        source: raw.source,
        checksum,
        dependencies: raw.dependencies,
        phases,
        group: raw.group,
        timeouts,
    })
}

/// Names and versions become directory names under the scripts, work and
/// log directories, so they must stay a single plain path component.
fn path_component_problem(value: &str) -> Option<&'static str> {
    if value.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if value.contains("..") {
        Some("must not contain '..'")
    } else if value.starts_with('.') {
        Some("must not start with '.'")
    } else if value.starts_with(char::is_whitespace) || value.ends_with(char::is_whitespace) {
        Some("must not start or end with whitespace")
    } else if value.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    }
}

/// Accept `sha256:<hex>` or bare `<hex>`; return lowercase hex.
fn parse_checksum(value: &str) -> Option<String> {
    let hex_part = value.strip_prefix("sha256:").unwrap_or(value);
    if hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex_part.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUM: &str = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn pkg(name: &str, deps: &[&str]) -> String {
        let deps: Vec<String> = deps.iter().map(|d| format!("\"{d}\"")).collect();
        format!(
            "[[package]]\nname = \"{name}\"\nversion = \"1.0\"\nsource = \"{name}.tar.xz\"\n\
             checksum = \"{SUM}\"\ndependencies = [{}]\n",
            deps.join(", ")
        )
    }

    #[test]
    fn test_parse_defaults_phase_sequence() {
        let m = Manifest::parse(&pkg("binutils", &[]), ManifestFormat::Toml).unwrap();
        let binutils = m.get("binutils").unwrap();
        assert_eq!(binutils.phases, Phase::STANDARD.to_vec());
        assert_eq!(binutils.checksum.len(), 64);
        assert!(!binutils.checksum.starts_with("sha256:"));
        assert_eq!(binutils.id(), "binutils-1.0");
    }

    #[test]
    fn test_phase_override_is_kept_in_order() {
        let text = format!("{}phases = [\"prepare\", \"build\", \"install\"]\n", pkg("zlib", &[]));
        let m = Manifest::parse(&text, ManifestFormat::Toml).unwrap();
        assert_eq!(
            m.get("zlib").unwrap().phases,
            vec![Phase::Prepare, Phase::Build, Phase::Install]
        );
    }

    #[test]
    fn test_duplicate_package_is_rejected() {
        let text = format!("{}{}", pkg("gcc", &[]), pkg("gcc", &[]));
        let err = Manifest::parse(&text, ManifestFormat::Toml).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicatePackage { name } if name == "gcc"));
    }

    #[test]
    fn test_unknown_dependency_names_missing_package() {
        let text = pkg("glibc", &["linux-headers"]);
        match Manifest::parse(&text, ManifestFormat::Toml).unwrap_err() {
            ManifestError::UnknownDependency {
                package,
                dependency,
            } => {
                assert_eq!(package, "glibc");
                assert_eq!(dependency, "linux-headers");
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let text = "[[package]]\nname = \"gcc\"\nversion = \"13\"\nsource = \"x\"\ndependencies = []\n";
        let err = Manifest::parse(text, ManifestFormat::Toml).unwrap_err();
        assert!(matches!(err, ManifestError::MalformedManifest { .. }));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_syntax_error_is_malformed() {
        let err = Manifest::parse("[[package]\nname=", ManifestFormat::Toml).unwrap_err();
        assert!(matches!(err, ManifestError::MalformedManifest { .. }));
    }

    #[test]
    fn test_unknown_phase_is_malformed() {
        let text = format!("{}phases = [\"prepare\", \"compile\"]\n", pkg("gcc", &[]));
        let err = Manifest::parse(&text, ManifestFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("compile"));
    }

    #[test]
    fn test_bad_checksum_is_malformed() {
        let text = pkg("gcc", &[]).replace(SUM, "md5:abc");
        let err = Manifest::parse(&text, ManifestFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_package_name_must_be_a_plain_directory_name() {
        for name in ["../../escape", "gcc/pass1", "gcc\\\\pass1", ".hidden", " gcc", "a..b"] {
            let err = Manifest::parse(&pkg(name, &[]), ManifestFormat::Toml).unwrap_err();
            assert!(
                matches!(err, ManifestError::MalformedManifest { .. }),
                "{name:?} was accepted"
            );
        }
        let m = Manifest::parse(&pkg("gcc-pass1", &[]), ManifestFormat::Toml).unwrap();
        assert!(m.get("gcc-pass1").is_some());
    }

    #[test]
    fn test_fallback_script_dir_name_is_reserved() {
        let err = Manifest::parse(&pkg("default", &[]), ManifestFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_version_must_not_leave_the_work_dir() {
        let text = pkg("gcc", &[]).replace("version = \"1.0\"", "version = \"../../1.0\"");
        let err = Manifest::parse(&text, ManifestFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("path separators"));
    }

    #[test]
    fn test_group_must_be_declared() {
        let text = format!(
            "phase_groups = [\"toolchain-pass1\"]\n{}group = \"final-system\"\n",
            pkg("gcc", &[])
        );
        let err = Manifest::parse(&text, ManifestFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("final-system"));
    }

    #[test]
    fn test_timeouts_parse_into_durations() {
        let text = format!("{}timeouts = {{ build = 600 }}\n", pkg("gcc", &[]));
        let m = Manifest::parse(&text, ManifestFormat::Toml).unwrap();
        assert_eq!(
            m.get("gcc").unwrap().timeouts.get(&Phase::Build),
            Some(&Duration::from_secs(600))
        );
    }

    #[test]
    fn test_timeout_for_unrun_phase_is_malformed() {
        let text = format!(
            "{}phases = [\"prepare\", \"build\"]\ntimeouts = {{ test = 60 }}\n",
            pkg("gcc", &[])
        );
        assert!(Manifest::parse(&text, ManifestFormat::Toml).is_err());
    }

    #[test]
    fn test_json_manifest_is_accepted() {
        let text = format!(
            r#"{{"packages": [{{"name": "m4", "version": "1.4.19", "source": "m4.tar.xz",
            "checksum": "{SUM}", "dependencies": []}}]}}"#
        );
        let m = Manifest::parse(&text, ManifestFormat::Json).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(
            ManifestFormat::from_path(Path::new("lfs.JSON")),
            ManifestFormat::Json
        );
    }

    #[test]
    fn test_digest_is_stable_for_same_text() {
        let text = pkg("gcc", &[]);
        let a = Manifest::parse(&text, ManifestFormat::Toml).unwrap();
        let b = Manifest::parse(&text, ManifestFormat::Toml).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_empty_manifest_is_malformed() {
        let err = Manifest::parse("", ManifestFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("no packages"));
    }
}
