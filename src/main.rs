use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use env_logger::Env;
use image::DynamicImage;
use log::debug;
use structopt::StructOpt;

use wcd_scanner::config::{default_library, load_contour};
use wcd_scanner::{report, save_report, Error, Marker, Result, Scanner, ScannerConfig, Source};

#[derive(StructOpt)]
#[structopt(
    name = "wcd_scanner",
    about = "Locates and decodes markers in an image with the native wcd engine."
)]
struct Opt {
    /// Decodes an image file
    #[structopt(short = "f", parse(from_os_str))]
    file: Option<PathBuf>,

    /// Downloads an image and decodes it
    #[structopt(short = "u")]
    url: Option<String>,

    /// Captures the primary screen and decodes it (unavailable in this build)
    #[structopt(short = "c")]
    capture: bool,

    /// Crops an image to its dominant contour
    #[structopt(short = "p", parse(from_os_str))]
    prune: Option<PathBuf>,

    /// Also writes the decode report to this file, or names the pruned image
    #[structopt(short = "o", long, parse(from_os_str))]
    output: Option<PathBuf>,

    #[structopt(long, parse(from_os_str))]
    library: Option<PathBuf>,

    /// 0 = auto, 1-99 = recompress as JPEG, 100 = as is
    #[structopt(long)]
    quality: Option<u32>,

    /// JSON file with contour parameters
    #[structopt(long, parse(from_os_str))]
    contour: Option<PathBuf>,

    /// Prints the corner points of every marker
    #[structopt(long)]
    points: bool,

    #[structopt(short = "v", long, parse(from_occurrences))]
    verbose: u8,
}

enum Mode {
    File(PathBuf),
    Url(String),
    Capture,
    Prune(PathBuf),
}

impl Opt {
    fn mode(&self) -> Option<Mode> {
        if let Some(file) = &self.file {
            Some(Mode::File(file.clone()))
        } else if let Some(url) = &self.url {
            Some(Mode::Url(url.clone()))
        } else if self.capture {
            Some(Mode::Capture)
        } else {
            self.prune.as_ref().map(|path| Mode::Prune(path.clone()))
        }
    }

    fn config(&self) -> Result<ScannerConfig> {
        let mut config = ScannerConfig {
            library: self.library.clone().unwrap_or_else(default_library),
            ..ScannerConfig::default()
        };

        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(path) = &self.contour {
            config.contour = load_contour(path)?;
        }

        Ok(config)
    }
}

fn main() {
    let opt = Opt::from_args();

    let level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let mode = match opt.mode() {
        Some(mode) => mode,
        None => {
            Opt::clap().print_help().ok();
            println!();
            return;
        }
    };

    if let Err(err) = run(&opt, mode) {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

fn run(opt: &Opt, mode: Mode) -> Result<()> {
    let config = opt.config()?;
    debug!("using engine {}", config.library.display());

    let stdout = io::stdout();
    let mut out = stdout.lock();

    match mode {
        Mode::File(path) => {
            let markers = Scanner::load(config)?.scan(Source::File(path))?;
            write_report(opt, &markers, &mut out)?;
        }
        Mode::Url(url) => {
            let image = download(&url)?;
            let markers = Scanner::load(config)?.scan(Source::Image(image))?;
            write_report(opt, &markers, &mut out)?;
        }
        Mode::Capture => return Err(Error::CaptureUnavailable),
        Mode::Prune(input) => {
            let image = image::open(&input)?;
            let output = opt
                .output
                .clone()
                .unwrap_or_else(|| pruned_path(&input));

            match Scanner::load(config)?.prune(&image)? {
                Some(pruned) => {
                    pruned.save(&output)?;
                    writeln!(
                        out,
                        "{}x{} -> {}",
                        pruned.width(),
                        pruned.height(),
                        output.display()
                    )?;
                }
                None => writeln!(out, "No contour")?,
            }
        }
    }

    Ok(())
}

fn write_report<W: Write>(opt: &Opt, markers: &[Marker], out: &mut W) -> Result<()> {
    report(markers, opt.points, out)?;

    if let Some(output) = &opt.output {
        save_report(markers, opt.points, output)?;
    }

    Ok(())
}

fn download(url: &str) -> Result<DynamicImage> {
    debug!("downloading {}", url);

    let response = ureq::get(url)
        .call()
        .map_err(|err| Error::Download(err.to_string()))?;
    let mut bytes = Vec::new();
    response.into_reader().read_to_end(&mut bytes)?;

    Ok(image::load_from_memory(&bytes)?)
}

fn pruned_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    input.with_file_name(format!("{}.pruned.png", stem))
}

#[test]
fn pruned_path_test() {
    assert_eq!(
        pruned_path(Path::new("scans/receipt.jpg")),
        PathBuf::from("scans/receipt.pruned.png")
    );
    assert_eq!(pruned_path(Path::new("a")), PathBuf::from("a.pruned.png"));
}

#[test]
fn mode_test() {
    let opt = Opt::from_iter(&["wcd_scanner", "-f", "codes.png", "--quality", "80"]);

    assert!(matches!(opt.mode(), Some(Mode::File(ref path)) if path == Path::new("codes.png")));
    assert_eq!(opt.config().unwrap().quality, 80);

    let opt = Opt::from_iter(&["wcd_scanner"]);
    assert!(opt.mode().is_none());

    let opt = Opt::from_iter(&["wcd_scanner", "-c"]);
    assert!(matches!(opt.mode(), Some(Mode::Capture)));
}

#[test]
fn write_report_test() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("codes.txt");
    let opt = Opt::from_iter(&[
        "wcd_scanner",
        "-f",
        "codes.png",
        "-o",
        path.to_str().unwrap(),
        "--points",
    ]);
    let markers = vec![Marker {
        text: "ABC123".to_string(),
        points: vec![wcd_scanner::Point { x: 1, y: 2 }],
    }];
    let mut out = Vec::new();

    write_report(&opt, &markers, &mut out).unwrap();

    let expected = "(0) ABC123\n - [1] (1, 2)\n";
    assert_eq!(String::from_utf8(out).unwrap(), expected);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), expected);

    let opt = Opt::from_iter(&["wcd_scanner", "-f", "codes.png"]);
    let mut out = Vec::new();
    write_report(&opt, &[], &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "No result\n");
}

#[test]
fn capture_help_test() {
    let mut help = Vec::new();
    Opt::clap().write_help(&mut help).unwrap();

    assert!(String::from_utf8(help)
        .unwrap()
        .contains("unavailable"));
}
