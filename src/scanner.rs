use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::DynamicImage;
use log::info;

use crate::config::ScannerConfig;
use crate::engine::{Engine, NativeEngine};
use crate::error::{Error, Result};
use crate::handle::EngineHandle;
use crate::marker::Marker;
use crate::pixels::Bitmap;

#[cfg(test)]
use crate::ffi::{ContourParameters, MAX_RESULTS, RAW_SCAN_RESULT_SIZE};
#[cfg(test)]
use crate::testing::{Call, FakeEngine, FakeRecord, PruneScript};
#[cfg(test)]
use image::{GenericImageView, Rgb, RgbImage};
#[cfg(test)]
use maplit::hashset;

pub enum Source {
    File(PathBuf),
    Image(DynamicImage),
}

/// Runs one engine session: initialize, one decode or prune, release.
pub struct Scanner<E: Engine> {
    handle: EngineHandle<E>,
    config: ScannerConfig,
}

impl Scanner<NativeEngine> {
    pub fn load(config: ScannerConfig) -> Result<Scanner<NativeEngine>> {
        let engine = NativeEngine::load(&config.library)?;
        Ok(Scanner::new(engine, config))
    }
}

impl<E: Engine> Scanner<E> {
    pub fn new(engine: E, config: ScannerConfig) -> Scanner<E> {
        Scanner {
            handle: EngineHandle::new(engine),
            config,
        }
    }

    pub fn scan(self, source: Source) -> Result<Vec<Marker>> {
        if let Source::File(path) = &source {
            if !path.is_file() {
                return Err(Error::MissingFile(path.clone()));
            }
        }

        let session = self.handle.session()?;

        let markers = match source {
            Source::File(path) => session.decode_file(&path, self.config.quality)?,
            Source::Image(image) => {
                let mut bitmap = Bitmap::from_image(&image);
                let mut pixels = bitmap.lock();
                session.decode_pixels(&mut pixels)?
            }
        };

        info!("found {} marker(s)", markers.len());
        Ok(markers)
    }

    /// Scans `source` and writes one line per marker to `out`.
    pub fn run<W: Write>(self, source: Source, show_points: bool, out: &mut W) -> Result<usize> {
        let markers = self.scan(source)?;
        report(&markers, show_points, out)?;
        Ok(markers.len())
    }

    /// Crops `image` to its dominant contour. `None` means no contour was
    /// found.
    pub fn prune(self, image: &DynamicImage) -> Result<Option<DynamicImage>> {
        let session = self.handle.session()?;
        let mut bitmap = Bitmap::from_image(image);

        let encoded = {
            let mut pixels = bitmap.lock();
            session.prune(&mut pixels, &self.config.contour)?
        };

        match encoded {
            Some(bytes) => Ok(Some(image::load_from_memory(&bytes)?)),
            None => Ok(None),
        }
    }
}

pub fn report<W: Write>(markers: &[Marker], show_points: bool, out: &mut W) -> io::Result<()> {
    if markers.is_empty() {
        return writeln!(out, "No result");
    }

    for (index, marker) in markers.iter().enumerate() {
        writeln!(out, "({}) {}", index, marker.text)?;

        if show_points {
            for (number, point) in marker.points.iter().enumerate() {
                writeln!(out, " - [{}] ({}, {})", number + 1, point.x, point.y)?;
            }
        }
    }

    Ok(())
}

/// Writes the same lines as [`report`] to the file at `path`, replacing it.
pub fn save_report(markers: &[Marker], show_points: bool, path: &Path) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    report(markers, show_points, &mut file)?;
    file.flush()?;

    info!("report written to {}", path.display());
    Ok(())
}

#[cfg(test)]
fn scan_file(engine: &FakeEngine, show_points: bool) -> (Result<usize>, String) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let scanner = Scanner::new(engine, ScannerConfig::default());
    let mut out = Vec::new();

    let result = scanner.run(Source::File(file.path().to_path_buf()), show_points, &mut out);

    (result, String::from_utf8(out).unwrap())
}

#[test]
fn no_result_test() {
    let engine = FakeEngine::new();

    let (result, out) = scan_file(&engine, false);

    assert_eq!(result.unwrap(), 0);
    assert_eq!(out, "No result\n");
    assert_eq!(engine.calls().last(), Some(&Call::ReleaseModel));
}

#[test]
fn decode_error_test() {
    let engine = FakeEngine::new();
    engine.fail_decode("bad image");

    let (result, out) = scan_file(&engine, false);

    assert!(matches!(result, Err(Error::Decode(ref message)) if message == "bad image"));
    assert_eq!(out, "");
    assert_eq!(engine.calls().last(), Some(&Call::ReleaseModel));
}

#[test]
fn two_results_test() {
    let engine = FakeEngine::new();
    engine.set_records(vec![
        FakeRecord::new("ABC123", &[(0, 0), (10, 10)]),
        FakeRecord::new("https://example.com/?q=1", &[(5, 5), (6, 6), (7, 7), (8, 8)]),
    ]);

    let (result, out) = scan_file(&engine, false);

    assert_eq!(result.unwrap(), 2);
    assert_eq!(out, "(0) ABC123\n(1) https://example.com/?q=1\n");
    assert_eq!(engine.live_allocations(), hashset!());
    assert_eq!(engine.frees(), 4);
    assert_eq!(engine.double_frees(), 0);
}

#[test]
fn points_report_test() {
    let engine = FakeEngine::new();
    engine.set_records(vec![FakeRecord::new("ABC123", &[(0, 0), (10, 10)])]);

    let (result, out) = scan_file(&engine, true);

    assert_eq!(result.unwrap(), 1);
    assert_eq!(out, "(0) ABC123\n - [1] (0, 0)\n - [2] (10, 10)\n");
}

#[test]
fn save_report_test() {
    use crate::ffi::Point;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.txt");
    let markers = vec![
        Marker {
            text: "ABC123".to_string(),
            points: vec![Point { x: 3, y: 4 }],
        },
        Marker {
            text: "XYZ".to_string(),
            points: Vec::new(),
        },
    ];

    save_report(&markers, true, &path).unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "(0) ABC123\n - [1] (3, 4)\n(1) XYZ\n"
    );

    save_report(&[], false, &path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "No result\n");

    assert!(matches!(
        save_report(&markers, false, &dir.path().join("missing").join("report.txt")),
        Err(Error::Io(_))
    ));
}

#[test]
fn missing_file_test() {
    let engine = FakeEngine::new();
    let scanner = Scanner::new(&engine, ScannerConfig::default());

    let result = scanner.scan(Source::File(PathBuf::from("./no-such-image.png")));

    assert!(matches!(result, Err(Error::MissingFile(_))));
    assert!(engine.calls().is_empty());
}

#[test]
fn init_failure_test() {
    let engine = FakeEngine::new();
    engine.fail_init(-1, "models\\detect.prototxt: not found");

    let (result, out) = scan_file(&engine, false);

    assert!(matches!(result, Err(Error::Init { code: -1, .. })));
    assert_eq!(out, "");
    assert!(!engine
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Decode { .. } | Call::ReleaseModel)));
}

#[test]
fn scan_image_test() {
    let engine = FakeEngine::new();
    engine.set_records(vec![FakeRecord::new("PIXELS", &[(1, 2)])]);
    let scanner = Scanner::new(&engine, ScannerConfig::default());
    let image = DynamicImage::ImageRgb8(RgbImage::new(7, 3));

    let markers = scanner.scan(Source::Image(image)).unwrap();

    assert_eq!(markers[0].text, "PIXELS");
    assert_eq!(
        engine.calls(),
        vec![
            Call::InitModel,
            Call::DecodeBitmap {
                width: 7,
                height: 3,
                stride: 24,
                channel_count: 3,
                buffer_size: (MAX_RESULTS * RAW_SCAN_RESULT_SIZE) as u64,
            },
            Call::ReleaseModel,
        ]
    );
}

#[test]
fn prune_no_contour_test() {
    let engine = FakeEngine::new();
    engine.set_prune(PruneScript::Reply {
        status: 1,
        data: Some(vec![0x89, b'P', b'N', b'G']),
        size: Some(0),
    });
    let scanner = Scanner::new(&engine, ScannerConfig::default());
    let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));

    assert!(scanner.prune(&image).unwrap().is_none());
    assert_eq!(engine.frees(), 1);
    assert_eq!(engine.live_allocations(), hashset!());
    assert_eq!(engine.calls().last(), Some(&Call::ReleaseModel));
}

#[test]
fn prune_crop_test() {
    let engine = FakeEngine::new();
    engine.set_prune(PruneScript::CropContour);
    let scanner = Scanner::new(&engine, ScannerConfig::default());

    let image = RgbImage::from_fn(200, 200, |x, y| {
        if (70..130).contains(&x) && (50..110).contains(&y) {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });

    let pruned = scanner
        .prune(&DynamicImage::ImageRgb8(image))
        .unwrap()
        .expect("square should be found");
    let (width, height) = pruned.dimensions();

    assert!((56..=70).contains(&width), "width {}", width);
    assert!((56..=70).contains(&height), "height {}", height);
    assert_eq!(engine.last_prune_params(), Some(ContourParameters::default()));
    assert_eq!(engine.live_allocations(), hashset!());
}

#[test]
fn prune_blank_image_test() {
    let engine = FakeEngine::new();
    engine.set_prune(PruneScript::CropContour);
    let scanner = Scanner::new(&engine, ScannerConfig::default());
    let image = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));

    assert!(scanner
        .prune(&DynamicImage::ImageRgb8(image))
        .unwrap()
        .is_none());
    assert_eq!(engine.frees(), 0);
}
