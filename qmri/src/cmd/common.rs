//! Options and helpers shared by every run tool: working directory, output
//! folder lifecycle, program/audit logs and image load/save plumbing.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use eyre::{eyre, Context, Result};
use libqmri::image_io::{self, DataType, ImageFormat};
use libqmri::{Image3D, ImageType};

#[derive(Debug, Parser)]
pub struct OutputOpts {
    /// Working directory to resolve relative paths against
    #[clap(long)]
    pub cwd: Option<PathBuf>,

    /// Output folder, created if missing
    #[clap(short, long)]
    pub output: PathBuf,

    /// Prefix joined in front of the output folder
    #[clap(long = "output_root")]
    pub output_root: Option<PathBuf>,

    /// Allow writing into an existing, non-empty output folder
    #[clap(long)]
    pub overwrite: bool,

    /// Image format for reading
    #[clap(long = "img_fmt_r", default_value = "ANALYZE")]
    pub img_fmt_r: String,

    /// Image format for writing
    #[clap(long = "img_fmt_w", default_value = "ANALYZE")]
    pub img_fmt_w: String,

    /// Skip writing the program log
    #[clap(long = "no_log")]
    pub no_log: bool,

    /// Skip writing the audit log
    #[clap(long = "no_audit")]
    pub no_audit: bool,
}

/// An opened run: resolved output folder plus the log sinks.
pub struct RunOutput {
    pub dir: PathBuf,
    pub read_format: ImageFormat,
    pub write_format: ImageFormat,
    program_log: Option<File>,
    audit_log: Option<File>,
}

impl OutputOpts {
    /// Create the output folder, open the logs and echo the invocation.
    pub fn open(&self, tool: &str) -> Result<RunOutput> {
        if let Some(cwd) = &self.cwd {
            std::env::set_current_dir(cwd)
                .wrap_err_with(|| format!("changing directory to {}", cwd.display()))?;
        }

        let dir = match &self.output_root {
            Some(root) => root.join(&self.output),
            None => self.output.clone(),
        };
        if dir.exists() && dir.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
            if !self.overwrite {
                return Err(eyre!(
                    "output folder {} exists and is not empty, pass --overwrite to reuse it",
                    dir.display()
                ));
            }
        }
        fs::create_dir_all(&dir).wrap_err_with(|| format!("creating {}", dir.display()))?;

        let program_log = if self.no_log {
            None
        } else {
            Some(File::create(dir.join(format!("{tool}_ProgramLog.txt")))?)
        };
        let audit_log = if self.no_audit {
            None
        } else {
            Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join("audit.log"))?,
            )
        };

        let mut run = RunOutput {
            dir,
            read_format: ImageFormat::parse(&self.img_fmt_r)?,
            write_format: ImageFormat::parse(&self.img_fmt_w)?,
            program_log,
            audit_log,
        };
        run.audit(&format!(
            "{tool} started: {}",
            std::env::args().collect::<Vec<_>>().join(" ")
        ));
        run.log(&format!("{tool} run started"));

        // echo the invocation so the run can be reproduced
        let config_path = run.dir.join(format!("{tool}_config.txt"));
        let mut cfg = File::create(config_path)?;
        for arg in std::env::args().skip(2) {
            writeln!(cfg, "{arg}")?;
        }
        Ok(run)
    }
}

impl RunOutput {
    pub fn log(&mut self, message: &str) {
        log::info!("{message}");
        if let Some(f) = &mut self.program_log {
            let _ = writeln!(f, "{} {message}", unix_secs());
        }
    }

    pub fn audit(&mut self, message: &str) {
        if let Some(f) = &mut self.audit_log {
            let _ = writeln!(f, "{} {message}", unix_secs());
        }
    }

    /// Write one named map into the output folder.
    pub fn save_map(&mut self, name: &str, img: &Image3D) -> Result<()> {
        let base = self.dir.join(name);
        image_io::write_image_3d(&base, img, self.write_format, DataType::Double)?;
        self.log(&format!("saved {name}"));
        Ok(())
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Load one image by its extension-less base path.
pub fn load_image(base: &Path, format: ImageFormat) -> Result<Image3D> {
    image_io::read_image_3d(base, format, true)
        .wrap_err_with(|| format!("loading {}", base.display()))
}

/// Load an optional ROI mask.
pub fn load_roi(path: Option<&PathBuf>, format: ImageFormat) -> Result<Option<Image3D>> {
    match path {
        Some(p) => {
            let mut roi = load_image(p, format)?;
            roi.set_image_type(ImageType::Roi);
            Ok(Some(roi))
        }
        None => Ok(None),
    }
}

/// Load a numbered dynamic series `{base}1 .. {base}N`.
pub fn load_dynamic_series(base: &Path, n_dyns: usize, format: ImageFormat) -> Result<Vec<Image3D>> {
    if n_dyns == 0 {
        return Err(eyre!("--n_dyns must be at least 1"));
    }
    let base_name = base
        .file_name()
        .ok_or_else(|| eyre!("dynamic series base name is empty"))?
        .to_string_lossy()
        .to_string();
    let parent = base.parent().unwrap_or_else(|| Path::new("."));
    (1..=n_dyns)
        .map(|i| load_image(&parent.join(format!("{base_name}{i}")), format))
        .collect()
}
