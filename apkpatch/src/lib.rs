use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zip::ZipArchive;

pub mod align;
pub mod archive;
pub mod arsc;
pub mod config;
mod error;
pub mod manifest;
pub mod res;
pub mod sign;
pub mod strings;
mod target;

pub use crate::config::{ExportConfig, FeatureConfig, Orientation, ScreenSupport, SigningConfig};
pub use crate::error::{Error, Result};
pub use crate::sign::Apksigner;
pub use crate::target::Target;

use crate::archive::{
    asset_compression, Compression, DirSink, EntryOutcome, EntryTransform, Sink, ZipSink,
};
use crate::arsc::ResourcePatch;
use crate::manifest::ManifestPatch;

/// Fixed path of the binary manifest inside a template archive.
pub const MANIFEST_PATH: &str = "AndroidManifest.xml";
/// Fixed path of the compiled resource table.
pub const RESOURCE_TABLE_PATH: &str = "resources.arsc";
/// Entry holding the marshalled launch arguments.
pub const LAUNCH_ARGS_PATH: &str = "assets/_cl_";

const SIGNATURE_PREFIX: &str = "META-INF";

/// Cooperative cancellation, observed at phase boundaries only. A
/// cancelled job still cleans up its intermediate files.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Removes the intermediate archive on every exit path.
struct TempGuard(PathBuf);

impl Drop for TempGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[derive(Clone, Debug)]
pub struct ExportReport {
    pub output: PathBuf,
    pub signed: bool,
}

/// Per-entry strategy of the export pass: route the manifest and resource
/// table through their patchers, substitute configured payloads, drop
/// disabled-architecture libraries and stale signature metadata, and
/// track which architectures the template actually covered.
struct ExportTransform<'a> {
    config: &'a ExportConfig,
    overrides: &'a BTreeMap<String, Vec<u8>>,
    strip_signatures: bool,
    seen: BTreeSet<Target>,
}

impl ExportTransform<'_> {
    fn missing_architectures(&self) -> Vec<String> {
        self.config
            .architectures
            .iter()
            .filter(|target| !self.seen.contains(target))
            .map(|target| target.android_abi().to_string())
            .collect()
    }
}

impl EntryTransform for ExportTransform<'_> {
    fn transform(
        &mut self,
        name: &str,
        compression: Compression,
        mut data: Vec<u8>,
    ) -> Result<EntryOutcome> {
        if name == MANIFEST_PATH {
            data = manifest::patch_manifest(&data, &ManifestPatch::new(self.config))?;
        } else if name == RESOURCE_TABLE_PATH {
            data = arsc::patch_resources(&data, &ResourcePatch::new(self.config))?;
        } else if let Some(replacement) = self.overrides.get(name) {
            data = replacement.clone();
        }
        if name.ends_with(".so") {
            match Target::ALL.iter().find(|t| name.starts_with(&t.lib_dir())) {
                Some(target) if self.config.architectures.contains(target) => {
                    self.seen.insert(*target);
                }
                _ => return Ok(EntryOutcome::Skip),
            }
        }
        if self.strip_signatures && name.starts_with(SIGNATURE_PREFIX) {
            // Stale signatures must not survive into an archive that is
            // about to be re-signed.
            return Ok(EntryOutcome::Skip);
        }
        Ok(EntryOutcome::Keep { data, compression })
    }
}

fn load_payloads(map: &BTreeMap<String, PathBuf>) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    for (name, path) in map {
        let data = std::fs::read(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound("configured file", path.clone())
            } else {
                Error::Io(err)
            }
        })?;
        out.insert(name.clone(), data);
    }
    Ok(out)
}

fn write_extras(
    sink: &mut dyn Sink,
    additions: &BTreeMap<String, Vec<u8>>,
    launch_args: &[String],
) -> Result<()> {
    for (name, data) in additions {
        sink.write_entry(name, data, asset_compression(name, data))?;
    }
    let blob = config::encode_launch_args(launch_args);
    sink.write_entry(LAUNCH_ARGS_PATH, &blob, Compression::Stored)?;
    Ok(())
}

fn unaligned_path(output: &Path) -> PathBuf {
    output.with_extension("unaligned.apk")
}

/// One export of a template archive into a patched, aligned and
/// optionally signed package.
pub struct ExportJob<'a> {
    pub template: &'a Path,
    pub output: &'a Path,
    pub config: &'a ExportConfig,
    pub signing: Option<&'a SigningConfig>,
    /// Explicit signing tool location; discovered when not set.
    pub apksigner: Option<&'a Path>,
}

impl ExportJob<'_> {
    pub fn run(&self, cancel: &CancelFlag) -> Result<ExportReport> {
        self.config.validate()?;
        if self.output.extension().and_then(|ext| ext.to_str()) != Some("apk") {
            return Err(Error::config("output file name must end in `.apk`"));
        }
        if let Some(parent) = self.output.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(Error::BadPath(self.output.to_path_buf()));
            }
        }
        if !self.template.is_file() {
            return Err(Error::NotFound(
                "template archive",
                self.template.to_path_buf(),
            ));
        }
        // Signing prerequisites are checked before any output exists.
        let signer = match self.signing {
            Some(signing) => {
                if !signing.keystore.is_file() {
                    return Err(Error::NotFound("keystore", signing.keystore.clone()));
                }
                Some(Apksigner::locate(self.apksigner)?)
            }
            None => None,
        };
        let overrides = load_payloads(&self.config.overrides)?;
        let additions = load_payloads(&self.config.add_files)?;

        let unaligned = unaligned_path(self.output);
        let _guard = TempGuard(unaligned.clone());

        tracing::info!(
            "rewriting {} from template {}",
            self.output.display(),
            self.template.display()
        );
        {
            let mut src = ZipArchive::new(BufReader::new(File::open(self.template)?))?;
            let mut sink = ZipSink::new(BufWriter::new(File::create(&unaligned)?));
            let mut transform = ExportTransform {
                config: self.config,
                overrides: &overrides,
                strip_signatures: self.signing.is_some(),
                seen: BTreeSet::new(),
            };
            archive::rewrite_archive(&mut src, &mut sink, &mut transform)?;
            let missing = transform.missing_architectures();
            if !missing.is_empty() {
                return Err(Error::ArchitectureCoverage(missing));
            }
            write_extras(&mut sink, &additions, &self.config.launch_args)?;
            let mut file = sink.finish()?;
            file.flush()?;
        }
        cancel.checkpoint()?;

        tracing::info!("aligning {}", self.output.display());
        let mut file = align::align_archive(
            BufReader::new(File::open(&unaligned)?),
            BufWriter::new(File::create(self.output)?),
            align::ALIGNMENT,
        )?;
        file.flush()?;
        drop(file);
        cancel.checkpoint()?;

        let mut signed = false;
        if let (Some(signer), Some(signing)) = (&signer, self.signing) {
            signer.sign(self.output, signing)?;
            signer.verify(self.output)?;
            signed = true;
        }
        Ok(ExportReport {
            output: self.output.to_path_buf(),
            signed,
        })
    }
}

/// The directory-based build mode: the same patchers and filters, with
/// logical paths written as files under `root` instead of archive
/// entries. No alignment or signing applies.
pub fn export_to_directory(
    template: &Path,
    root: &Path,
    config: &ExportConfig,
    cancel: &CancelFlag,
) -> Result<()> {
    config.validate()?;
    if !template.is_file() {
        return Err(Error::NotFound("template archive", template.to_path_buf()));
    }
    let overrides = load_payloads(&config.overrides)?;
    let additions = load_payloads(&config.add_files)?;
    cancel.checkpoint()?;

    let mut src = ZipArchive::new(BufReader::new(File::open(template)?))?;
    let mut sink = DirSink::new(root);
    let mut transform = ExportTransform {
        config,
        overrides: &overrides,
        strip_signatures: false,
        seen: BTreeSet::new(),
    };
    archive::rewrite_archive(&mut src, &mut sink, &mut transform)?;
    let missing = transform.missing_architectures();
    if !missing.is_empty() {
        return Err(Error::ArchitectureCoverage(missing));
    }
    write_extras(&mut sink, &additions, &config.launch_args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use crate::manifest::tests::{build_template, read_elements};
    use std::io::Read;

    fn init_logger() {
        use tracing_subscriber::EnvFilter;
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    }

    fn workdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("apkpatch-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn template_zip() -> Vec<u8> {
        let manifest = build_template();
        let resources = crate::arsc::tests::build_table(&["template-app-name", "style/Theme"]);
        build_zip(&[
            (MANIFEST_PATH, &manifest, Compression::Deflated),
            (RESOURCE_TABLE_PATH, &resources, Compression::Stored),
            ("lib/armeabi-v7a/libmain.so", b"elf-arm32", Compression::Deflated),
            ("lib/arm64-v8a/libmain.so", b"elf-arm64", Compression::Deflated),
            ("lib/x86/libmain.so", b"elf-x86", Compression::Deflated),
            ("META-INF/MANIFEST.MF", b"old signature", Compression::Deflated),
            ("assets/splash.png", b"\x89PNG odd", Compression::Stored),
            ("assets/data.bin", b"payload", Compression::Stored),
        ])
    }

    fn config() -> ExportConfig {
        ExportConfig {
            package_name: "org.test.game".into(),
            version_code: 7,
            version_name: "1.2.3".into(),
            app_name: None,
            app_name_locales: BTreeMap::new(),
            orientation: Orientation::Portrait,
            screens: ScreenSupport::default(),
            allow_backup: false,
            permissions: vec![
                "android.permission.INTERNET".into(),
                "android.permission.CAMERA".into(),
            ],
            features: vec![],
            architectures: vec![Target::ArmV7a, Target::Arm64V8a],
            launch_args: vec!["--verbose".into()],
            overrides: BTreeMap::new(),
            add_files: BTreeMap::new(),
        }
    }

    fn entry_bytes(archive: &[u8], name: &str) -> Vec<u8> {
        let mut zip = ZipArchive::new(std::io::Cursor::new(archive.to_vec())).unwrap();
        let mut entry = zip.by_name(name).unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn full_export_pipeline() -> Result<()> {
        init_logger();
        let dir = workdir("export");
        let template = dir.join("template.apk");
        std::fs::write(&template, template_zip())?;
        let output = dir.join("game.apk");
        let config = config();
        let job = ExportJob {
            template: &template,
            output: &output,
            config: &config,
            signing: None,
            apksigner: None,
        };
        let report = job.run(&CancelFlag::new())?;
        assert!(!report.signed);
        assert!(!unaligned_path(&output).exists());

        let archive = std::fs::read(&output)?;
        assert!(
            check_aligned(&archive)?,
            "stored entries must land on 4-byte offsets"
        );

        let manifest = entry_bytes(&archive, MANIFEST_PATH);
        let elements = read_elements(&manifest)?;
        let root = elements.iter().find(|e| e.tag == "manifest").unwrap();
        let package = root.attrs.iter().find(|(n, _, _)| n == "package").unwrap();
        assert_eq!(package.1.as_deref(), Some("org.test.game"));
        assert!(elements.iter().any(|e| e.tag == "uses-permission"
            && e.attrs
                .iter()
                .any(|(_, v, _)| v.as_deref() == Some("android.permission.CAMERA"))));

        let resources = entry_bytes(&archive, RESOURCE_TABLE_PATH);
        assert_eq!(
            crate::arsc::tests::output_strings(&resources),
            ["game", "style/Theme"]
        );

        let mut zip = ZipArchive::new(std::io::Cursor::new(archive.clone()))?;
        assert!(zip.by_name("lib/x86/libmain.so").is_err());
        assert!(zip.by_name("lib/arm64-v8a/libmain.so").is_ok());
        // Unsigned export keeps the template's signature metadata.
        assert!(zip.by_name("META-INF/MANIFEST.MF").is_ok());

        let blob = entry_bytes(&archive, LAUNCH_ARGS_PATH);
        assert_eq!(u32::from_le_bytes(blob[0..4].try_into().unwrap()), 1);
        assert_eq!(&blob[8..], b"--verbose");

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn check_aligned(archive: &[u8]) -> Result<bool> {
        Ok(align::check_alignment(
            std::io::Cursor::new(archive.to_vec()),
            align::ALIGNMENT as u64,
        )?
        .is_empty())
    }

    #[test]
    fn strips_signatures_and_disabled_abis() -> Result<()> {
        let config = config();
        let overrides = BTreeMap::new();
        let mut transform = ExportTransform {
            config: &config,
            overrides: &overrides,
            strip_signatures: true,
            seen: BTreeSet::new(),
        };
        assert!(matches!(
            transform.transform("META-INF/CERT.RSA", Compression::Deflated, vec![])?,
            EntryOutcome::Skip
        ));
        assert!(matches!(
            transform.transform("lib/x86/libmain.so", Compression::Deflated, vec![])?,
            EntryOutcome::Skip
        ));
        assert!(matches!(
            transform.transform("lib/armeabi-v7a/libmain.so", Compression::Deflated, vec![])?,
            EntryOutcome::Keep { .. }
        ));
        assert_eq!(transform.missing_architectures(), ["arm64-v8a"]);
        Ok(())
    }

    #[test]
    fn missing_architecture_is_reported() -> Result<()> {
        let dir = workdir("coverage");
        let template = dir.join("template.apk");
        std::fs::write(&template, template_zip())?;
        let output = dir.join("game.apk");
        let mut config = config();
        config.architectures.push(Target::X86_64);
        let job = ExportJob {
            template: &template,
            output: &output,
            config: &config,
            signing: None,
            apksigner: None,
        };
        match job.run(&CancelFlag::new()) {
            Err(Error::ArchitectureCoverage(missing)) => {
                assert_eq!(missing, ["x86_64"]);
            }
            other => panic!("expected coverage failure, got {other:?}"),
        }
        assert!(!unaligned_path(&output).exists());
        assert!(!output.exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn cancelled_job_cleans_up() -> Result<()> {
        let dir = workdir("cancel");
        let template = dir.join("template.apk");
        std::fs::write(&template, template_zip())?;
        let output = dir.join("game.apk");
        let config = config();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let job = ExportJob {
            template: &template,
            output: &output,
            config: &config,
            signing: None,
            apksigner: None,
        };
        assert!(matches!(job.run(&cancel), Err(Error::Cancelled)));
        assert!(!unaligned_path(&output).exists());
        assert!(!output.exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn rejects_wrong_output_extension() -> Result<()> {
        let dir = workdir("extension");
        let template = dir.join("template.apk");
        std::fs::write(&template, template_zip())?;
        let output = dir.join("game.zip");
        let config = config();
        let job = ExportJob {
            template: &template,
            output: &output,
            config: &config,
            signing: None,
            apksigner: None,
        };
        assert!(matches!(
            job.run(&CancelFlag::new()),
            Err(Error::InvalidConfiguration(_))
        ));
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn missing_keystore_aborts_before_output() -> Result<()> {
        let dir = workdir("keystore");
        let template = dir.join("template.apk");
        std::fs::write(&template, template_zip())?;
        let output = dir.join("game.apk");
        let config = config();
        let signing = SigningConfig {
            keystore: dir.join("absent.keystore"),
            key_alias: "release".into(),
            password: "secret".into(),
        };
        let job = ExportJob {
            template: &template,
            output: &output,
            config: &config,
            signing: Some(&signing),
            apksigner: None,
        };
        assert!(matches!(
            job.run(&CancelFlag::new()),
            Err(Error::NotFound("keystore", _))
        ));
        assert!(!output.exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn directory_build_mode() -> Result<()> {
        let dir = workdir("dirmode");
        let template = dir.join("template.apk");
        std::fs::write(&template, template_zip())?;
        let root = dir.join("build");
        let config = config();
        export_to_directory(&template, &root, &config, &CancelFlag::new())?;

        let manifest = std::fs::read(root.join(MANIFEST_PATH))?;
        let elements = read_elements(&manifest)?;
        let manifest_el = elements.iter().find(|e| e.tag == "manifest").unwrap();
        let package = manifest_el
            .attrs
            .iter()
            .find(|(n, _, _)| n == "package")
            .unwrap();
        assert_eq!(package.1.as_deref(), Some("org.test.game"));
        assert!(root.join("assets/data.bin").is_file());
        assert!(root.join(LAUNCH_ARGS_PATH).is_file());
        assert!(!root.join("lib/x86/libmain.so").exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
