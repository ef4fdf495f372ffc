//! The workload under test and its `.kmatrix.toml` definition.
//!
//! ```toml
//! name = "hello"
//! kind = "module"
//! test_script = "test.sh"
//!
//! [build]
//! command = ["make", "KERNEL=/lib/modules/$KERNEL_RELEASE/build"]
//!
//! [vm]
//! cpus = 2
//! memory_mb = 1024
//! smep = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KmatrixError, Result};

/// File name of an artifact definition inside its source directory.
pub const ARTIFACT_FILE: &str = ".kmatrix.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Loadable kernel module, inserted before the test script runs.
    Module,
    /// Userspace exploit binary.
    Exploit,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Module => "module",
            ArtifactKind::Exploit => "exploit",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and page-table hardening switches of the guest. Each is explicitly on
/// or off; none is left to the kernel default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityToggles {
    pub kaslr: bool,
    pub smep: bool,
    pub smap: bool,
    pub kpti: bool,
}

impl Default for SecurityToggles {
    fn default() -> Self {
        SecurityToggles {
            kaslr: true,
            smep: true,
            smap: true,
            kpti: true,
        }
    }
}

impl SecurityToggles {
    /// Kernel command-line arguments expressing the toggles.
    pub fn cmdline_args(&self) -> Vec<&'static str> {
        let mut args = vec![if self.kaslr { "kaslr" } else { "nokaslr" }];
        if !self.smep {
            args.push("nosmep");
        }
        if !self.smap {
            args.push("nosmap");
        }
        args.push(if self.kpti { "pti=on" } else { "nopti" });
        args
    }

    /// CPU model feature flags (`-cpu host,<flags>`).
    pub fn cpu_flags(&self) -> String {
        format!(
            "{}smep,{}smap",
            if self.smep { "+" } else { "-" },
            if self.smap { "+" } else { "-" }
        )
    }
}

/// Guest machine shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSpec {
    pub cpus: u32,
    pub memory_mb: u32,
    #[serde(flatten)]
    pub toggles: SecurityToggles,
}

impl Default for VmSpec {
    fn default() -> Self {
        VmSpec {
            cpus: 1,
            memory_mb: 512,
            toggles: SecurityToggles::default(),
        }
    }
}

/// How the artifact is built inside the build environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSpec {
    /// Overrides the target kernel's build image.
    pub image: Option<String>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Build product relative to the source directory. Defaults to
    /// `<name>.ko` for modules and `<name>` for exploits.
    pub output: Option<PathBuf>,
}

impl Default for BuildSpec {
    fn default() -> Self {
        BuildSpec {
            image: None,
            command: vec!["make".to_string()],
            env: BTreeMap::new(),
            output: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactFile {
    name: String,
    kind: ArtifactKind,
    #[serde(default)]
    binary: Option<PathBuf>,
    #[serde(default)]
    test_script: Option<PathBuf>,
    #[serde(default)]
    build: BuildSpec,
    #[serde(default)]
    vm: VmSpec,
}

/// Workload under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    /// Source directory; copied into each run's private workdir.
    pub source_dir: PathBuf,
    /// Prebuilt binary. When set the build stage is skipped.
    pub binary: Option<PathBuf>,
    pub test_script: PathBuf,
    pub build: BuildSpec,
    pub vm: VmSpec,
}

impl Artifact {
    pub fn new(name: impl Into<String>, kind: ArtifactKind, source_dir: impl Into<PathBuf>) -> Self {
        let source_dir = source_dir.into();
        Artifact {
            name: name.into(),
            kind,
            test_script: source_dir.join("test.sh"),
            source_dir,
            binary: None,
            build: BuildSpec::default(),
            vm: VmSpec::default(),
        }
    }

    /// Read `<dir>/.kmatrix.toml`. Relative paths resolve against `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let path = dir.join(ARTIFACT_FILE);
        let document = std::fs::read_to_string(&path).map_err(|e| {
            KmatrixError::InvalidArtifact(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(dir, &document)
    }

    pub fn from_toml_str(dir: &Path, document: &str) -> Result<Self> {
        let file: ArtifactFile = toml::from_str(document)
            .map_err(|e| KmatrixError::InvalidArtifact(format!("{}: {}", dir.display(), e)))?;

        if file.name.is_empty() || file.name.contains('/') {
            return Err(KmatrixError::InvalidArtifact(format!(
                "invalid artifact name {:?}",
                file.name
            )));
        }
        if file.build.command.is_empty() && file.binary.is_none() {
            return Err(KmatrixError::InvalidArtifact(format!(
                "{}: build command is empty and no binary is given",
                file.name
            )));
        }
        if file.vm.cpus == 0 || file.vm.memory_mb == 0 {
            return Err(KmatrixError::InvalidArtifact(format!(
                "{}: vm needs at least one cpu and some memory",
                file.name
            )));
        }

        Ok(Artifact {
            test_script: dir.join(file.test_script.unwrap_or_else(|| PathBuf::from("test.sh"))),
            binary: file.binary.map(|b| dir.join(b)),
            name: file.name,
            kind: file.kind,
            source_dir: dir.to_path_buf(),
            build: file.build,
            vm: file.vm,
        })
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn with_test_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.test_script = script.into();
        self
    }

    pub fn with_vm(mut self, vm: VmSpec) -> Self {
        self.vm = vm;
        self
    }

    /// Build product path relative to the build directory.
    pub fn output_path(&self) -> PathBuf {
        self.build.output.clone().unwrap_or_else(|| match self.kind {
            ArtifactKind::Module => PathBuf::from(format!("{}.ko", self.name)),
            ArtifactKind::Exploit => PathBuf::from(&self.name),
        })
    }

    /// File name of the artifact once deployed.
    pub fn deployed_name(&self) -> String {
        match self.kind {
            ArtifactKind::Module => format!("{}.ko", self.name),
            ArtifactKind::Exploit => self.name.clone(),
        }
    }
}

/// Starter `.kmatrix.toml` for a new artifact of `kind`, listing every
/// setting with its default.
pub fn skeleton(kind: ArtifactKind, name: &str) -> String {
    let (test_note, output) = match kind {
        ArtifactKind::Module => (
            "# Runs in the guest after the module is inserted, with the deployed\n\
             # module path as its first argument. Exit 0 means success.",
            format!("{name}.ko"),
        ),
        ArtifactKind::Exploit => (
            "# Runs in the guest with the deployed exploit path as its first\n\
             # argument. Exit 0 means the exploit worked.",
            name.to_string(),
        ),
    };
    let vm = VmSpec::default();
    let toggles = vm.toggles;

    format!(
        "name = \"{name}\"\n\
         kind = \"{kind}\"\n\
         \n\
         {test_note}\n\
         test_script = \"test.sh\"\n\
         \n\
         [build]\n\
         # Runs in the build container with the sources at /work. KERNEL (the\n\
         # headers directory) and KERNEL_RELEASE are set in its environment.\n\
         command = [\"make\"]\n\
         # output = \"{output}\"\n\
         \n\
         [vm]\n\
         cpus = {cpus}\n\
         memory_mb = {memory_mb}\n\
         kaslr = {kaslr}\n\
         smep = {smep}\n\
         smap = {smap}\n\
         kpti = {kpti}\n",
        cpus = vm.cpus,
        memory_mb = vm.memory_mb,
        kaslr = toggles.kaslr,
        smep = toggles.smep,
        smap = toggles.smap,
        kpti = toggles.kpti,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggles_render_every_switch() {
        let all_on = SecurityToggles::default();
        assert_eq!(all_on.cmdline_args(), vec!["kaslr", "pti=on"]);
        assert_eq!(all_on.cpu_flags(), "+smep,+smap");

        let all_off = SecurityToggles {
            kaslr: false,
            smep: false,
            smap: false,
            kpti: false,
        };
        assert_eq!(
            all_off.cmdline_args(),
            vec!["nokaslr", "nosmep", "nosmap", "nopti"]
        );
        assert_eq!(all_off.cpu_flags(), "-smep,-smap");
    }

    #[test]
    fn test_load_module_definition() {
        let dir = Path::new("/src/hello");
        let artifact = Artifact::from_toml_str(
            dir,
            r#"
            name = "hello"
            kind = "module"

            [build]
            env = { DEBUG = "1" }

            [vm]
            cpus = 2
            smap = false
            "#,
        )
        .unwrap();

        assert_eq!(artifact.kind, ArtifactKind::Module);
        assert_eq!(artifact.test_script, PathBuf::from("/src/hello/test.sh"));
        assert_eq!(artifact.build.command, vec!["make"]);
        assert_eq!(artifact.build.env.get("DEBUG").map(String::as_str), Some("1"));
        assert_eq!(artifact.vm.cpus, 2);
        assert_eq!(artifact.vm.memory_mb, 512);
        assert!(artifact.vm.toggles.smep);
        assert!(!artifact.vm.toggles.smap);
        assert_eq!(artifact.output_path(), PathBuf::from("hello.ko"));
    }

    #[test]
    fn test_exploit_with_prebuilt_binary() {
        let artifact = Artifact::from_toml_str(
            Path::new("/src/poc"),
            r#"
            name = "poc"
            kind = "exploit"
            binary = "bin/poc"
            test_script = "check.sh"
            "#,
        )
        .unwrap();

        assert_eq!(artifact.binary, Some(PathBuf::from("/src/poc/bin/poc")));
        assert_eq!(artifact.test_script, PathBuf::from("/src/poc/check.sh"));
        assert_eq!(artifact.deployed_name(), "poc");
    }

    #[test]
    fn test_unknown_kind_is_invalid_artifact() {
        let err = Artifact::from_toml_str(Path::new("/x"), "name = \"x\"\nkind = \"driver\"")
            .unwrap_err();
        assert!(matches!(err, KmatrixError::InvalidArtifact(_)));
    }

    #[test]
    fn test_zero_cpus_rejected() {
        let err = Artifact::from_toml_str(
            Path::new("/x"),
            "name = \"x\"\nkind = \"exploit\"\n[vm]\ncpus = 0",
        )
        .unwrap_err();
        assert!(matches!(err, KmatrixError::InvalidArtifact(_)));
    }

    #[test]
    fn test_load_reads_definition_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(ARTIFACT_FILE),
            "name = \"m\"\nkind = \"module\"\n",
        )
        .unwrap();
        let artifact = Artifact::load(dir.path()).unwrap();
        assert_eq!(artifact.source_dir, dir.path());

        let missing = Artifact::load(dir.path().join("nope")).unwrap_err();
        assert!(matches!(missing, KmatrixError::InvalidArtifact(_)));
    }

    #[test]
    fn test_skeletons_load_back_with_defaults() {
        let dir = Path::new("/src/poc");
        for kind in [ArtifactKind::Module, ArtifactKind::Exploit] {
            let document = skeleton(kind, "poc");
            let artifact = Artifact::from_toml_str(dir, &document).unwrap();

            assert_eq!(artifact.name, "poc");
            assert_eq!(artifact.kind, kind);
            assert_eq!(artifact.test_script, dir.join("test.sh"));
            assert_eq!(artifact.build, BuildSpec::default());
            assert_eq!(artifact.vm, VmSpec::default());
            assert_eq!(artifact.binary, None);
        }
    }

    #[test]
    fn test_module_skeleton_mentions_module_output() {
        let document = skeleton(ArtifactKind::Module, "hello");
        assert!(document.contains("kind = \"module\""));
        assert!(document.contains("# output = \"hello.ko\""));
        assert!(document.contains("after the module is inserted"));
    }
}
