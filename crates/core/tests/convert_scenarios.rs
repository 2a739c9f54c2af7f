use std::fs;
use std::path::{Path, PathBuf};

use image::{ImageBuffer, Rgb, RgbImage, Rgba};
use pairtile_core::config::ConvertConfig;
use pairtile_core::error::PairtileError;
use pairtile_core::pipeline::{ConvertPipeline, RunSummary};

/// Each pixel encodes its own position: red = row, green = column (mod 256).
fn write_gradient(path: &Path, width: u32, height: u32) {
    fs::create_dir_all(path.parent().expect("parent dir")).expect("create source dir");
    let image: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(y % 256) as u8, (x % 256) as u8, 0])
    });
    image.save(path).expect("write source png");
}

fn tile_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read tile dir")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}

fn open_rgb(path: &Path) -> RgbImage {
    image::open(path).expect("open tile").to_rgb8()
}

fn config(target: PathBuf, input: Option<PathBuf>, output_dir: PathBuf) -> ConvertConfig {
    ConvertConfig {
        target,
        input,
        output_dir,
        writer_threads: 2,
        ..Default::default()
    }
}

async fn run(config: ConvertConfig) -> anyhow::Result<RunSummary> {
    ConvertPipeline::from_config(config).run().await
}

#[tokio::test]
async fn single_target_is_cropped_from_the_origin() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("hr/0001.png"), 1000, 1000);

    let config = ConvertConfig {
        max_tile_size: 400,
        ..config(temp.path().join("hr"), None, temp.path().join("out"))
    };
    let summary = run(config).await.expect("conversion succeeds");

    assert_eq!(summary.pairs_processed, 1);
    assert_eq!(summary.tiles_written, 1);
    assert_eq!(tile_names(&temp.path().join("out/y")), vec!["0001.png"]);
    assert!(!temp.path().join("out/x").exists());

    let tile = open_rgb(&temp.path().join("out/y/0001.png"));
    assert_eq!(tile.dimensions(), (400, 400));
    assert_eq!(tile.get_pixel(0, 0).0, [0, 0, 0]);
    assert_eq!(tile.get_pixel(399, 200).0, [200, 143, 0]);
}

#[tokio::test]
async fn paired_crop_bounds_the_low_res_side() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("lr/a.png"), 256, 256);
    write_gradient(&temp.path().join("hr/a.png"), 1024, 1024);

    let config = ConvertConfig {
        max_tile_size: 128,
        ..config(
            temp.path().join("hr"),
            Some(temp.path().join("lr")),
            temp.path().join("out"),
        )
    };
    let summary = run(config).await.expect("conversion succeeds");
    assert_eq!(summary.tiles_written, 2);

    let x = open_rgb(&temp.path().join("out/x/a.png"));
    let y = open_rgb(&temp.path().join("out/y/a.png"));
    assert_eq!(x.dimensions(), (128, 128));
    assert_eq!(y.dimensions(), (512, 512));
    assert_eq!(x.get_pixel(0, 0).0, [0, 0, 0]);
    assert_eq!(y.get_pixel(0, 0).0, [0, 0, 0]);
    assert_eq!(y.get_pixel(300, 10).0, [10, 44, 0]);
}

#[tokio::test]
async fn split_target_walks_a_five_by_five_grid() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("hr/img.png"), 300, 300);

    let config = ConvertConfig {
        max_tile_size: 100,
        split_enabled: true,
        split_step_rate: 0.5,
        ..config(temp.path().join("hr"), None, temp.path().join("out"))
    };
    let summary = run(config).await.expect("conversion succeeds");
    assert_eq!(summary.tiles_written, 25);

    let names = tile_names(&temp.path().join("out/y"));
    let expected: Vec<String> = (0..25).map(|n| format!("img.{n:03}.png")).collect();
    assert_eq!(names, expected);

    let offsets = [0_u8, 50, 100, 150, 200];
    for (index, name) in names.iter().enumerate() {
        let tile = open_rgb(&temp.path().join("out/y").join(name));
        assert_eq!(tile.dimensions(), (100, 100), "{name}");
        let (row, col) = (offsets[index / 5], offsets[index % 5]);
        assert_eq!(tile.get_pixel(0, 0).0, [row, col, 0], "{name}");
    }
}

#[tokio::test]
async fn missing_input_key_fails_before_any_output() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("lr/a.png"), 500, 1000);
    write_gradient(&temp.path().join("hr/a.png"), 500, 1000);
    write_gradient(&temp.path().join("hr/b.png"), 500, 1000);

    let config = config(
        temp.path().join("hr"),
        Some(temp.path().join("lr")),
        temp.path().join("out"),
    );
    let error = run(config).await.expect_err("b has no input image");

    match error.downcast_ref::<PairtileError>() {
        Some(PairtileError::MissingPair { key }) => assert_eq!(key, "b"),
        other => panic!("expected MissingPair, got {other:?}"),
    }
    assert!(!temp.path().join("out").exists());
}

#[tokio::test]
async fn paired_split_keeps_tiles_in_register() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("lr/a.png"), 64, 64);
    write_gradient(&temp.path().join("hr/a.png"), 128, 128);

    let config = ConvertConfig {
        max_tile_size: 32,
        split_enabled: true,
        split_step_rate: 1.0,
        ..config(
            temp.path().join("hr"),
            Some(temp.path().join("lr")),
            temp.path().join("out"),
        )
    };
    let summary = run(config).await.expect("conversion succeeds");
    assert_eq!(summary.tiles_written, 8);

    let x_names = tile_names(&temp.path().join("out/x"));
    assert_eq!(x_names, tile_names(&temp.path().join("out/y")));
    assert_eq!(x_names.len(), 4);

    let x = open_rgb(&temp.path().join("out/x/a.003.png"));
    let y = open_rgb(&temp.path().join("out/y/a.003.png"));
    assert_eq!(x.dimensions(), (32, 32));
    assert_eq!(y.dimensions(), (64, 64));
    assert_eq!(x.get_pixel(0, 0).0, [32, 32, 0]);
    assert_eq!(y.get_pixel(0, 0).0, [64, 64, 0]);
}

#[tokio::test]
async fn transparent_pairs_are_skipped_not_fatal() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("hr/a.png"), 40, 40);
    fs::create_dir_all(temp.path().join("hr")).expect("create dir");
    ImageBuffer::<Rgba<u8>, Vec<u8>>::new(40, 40)
        .save(temp.path().join("hr/b.png"))
        .expect("write rgba png");

    let summary = run(config(temp.path().join("hr"), None, temp.path().join("out")))
        .await
        .expect("conversion succeeds");

    assert_eq!(summary.pairs_total, 2);
    assert_eq!(summary.pairs_processed, 1);
    assert_eq!(summary.skipped_transparent, 1);
    assert_eq!(tile_names(&temp.path().join("out/y")), vec!["a.png"]);
}

#[tokio::test]
async fn anisotropic_pair_aborts_the_run() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("lr/a.png"), 100, 100);
    write_gradient(&temp.path().join("hr/a.png"), 300, 200);

    let config = ConvertConfig {
        max_tile_size: 50,
        ..config(
            temp.path().join("hr"),
            Some(temp.path().join("lr")),
            temp.path().join("out"),
        )
    };
    let error = run(config).await.expect_err("ratios differ per axis");

    assert!(matches!(
        error.downcast_ref::<PairtileError>(),
        Some(PairtileError::ScaleMismatch { .. })
    ));
    assert!(tile_names(&temp.path().join("out/y")).is_empty());
}

#[tokio::test]
async fn invalid_config_fails_before_touching_disk() {
    let temp = tempfile::tempdir().expect("create temp dir");
    let config = ConvertConfig {
        split_enabled: true,
        ..config(temp.path().join("hr"), None, temp.path().join("out"))
    };

    let error = run(config).await.expect_err("split needs a max size");
    assert!(matches!(
        error.downcast_ref::<PairtileError>(),
        Some(PairtileError::Configuration(_))
    ));
    assert!(!temp.path().join("out").exists());
}

#[tokio::test]
async fn index_file_sources_and_stale_tiles() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("images/lr/one.png"), 20, 20);
    write_gradient(&temp.path().join("images/hr/one.png"), 40, 40);
    fs::write(
        temp.path().join("images/input.csv"),
        "# low-res list\nlr/one.png,flip\n",
    )
    .expect("write input index");
    fs::write(temp.path().join("images/target.txt"), "hr/one.png\n").expect("write target index");

    let stale = temp.path().join("out/y/stale.png");
    fs::create_dir_all(stale.parent().expect("parent")).expect("create stale dir");
    fs::write(&stale, b"old").expect("write stale tile");

    let summary = run(config(
        temp.path().join("images/target.txt"),
        Some(temp.path().join("images/input.csv")),
        temp.path().join("out"),
    ))
    .await
    .expect("conversion succeeds");

    assert_eq!(summary.tiles_written, 2);
    assert!(!stale.exists());
    assert_eq!(tile_names(&temp.path().join("out/x")), vec!["one.png"]);
    assert_eq!(tile_names(&temp.path().join("out/y")), vec!["one.png"]);
}

#[tokio::test]
async fn progress_reports_every_pair() {
    let temp = tempfile::tempdir().expect("create temp dir");
    for name in ["a", "b", "c"] {
        write_gradient(&temp.path().join(format!("hr/{name}.png")), 8, 8);
    }

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    ConvertPipeline::from_config(config(
        temp.path().join("hr"),
        None,
        temp.path().join("out"),
    ))
    .with_progress(Box::new(move |done, total| {
        sink.lock().expect("progress mutex").push((done, total));
    }))
    .run()
    .await
    .expect("conversion succeeds");

    assert_eq!(
        *seen.lock().expect("progress mutex"),
        vec![(1, 3), (2, 3), (3, 3)]
    );
}

#[tokio::test]
async fn fractional_ratio_crop_needs_whole_high_res_pixels() {
    let temp = tempfile::tempdir().expect("create temp dir");
    write_gradient(&temp.path().join("lr/a.png"), 100, 100);
    write_gradient(&temp.path().join("hr/a.png"), 150, 150);
    let paired = |max_tile_size| ConvertConfig {
        max_tile_size,
        ..config(
            temp.path().join("hr"),
            Some(temp.path().join("lr")),
            temp.path().join("out"),
        )
    };

    run(paired(32)).await.expect("32 * 1.5 = 48");
    assert_eq!(open_rgb(&temp.path().join("out/x/a.png")).dimensions(), (32, 32));
    assert_eq!(open_rgb(&temp.path().join("out/y/a.png")).dimensions(), (48, 48));

    let error = run(paired(33)).await.expect_err("33 * 1.5 = 49.5");
    assert!(matches!(
        error.downcast_ref::<PairtileError>(),
        Some(PairtileError::TileAlignment { .. })
    ));
    assert!(tile_names(&temp.path().join("out/y")).is_empty());
}

#[tokio::test]
async fn subdir_keys_pair_flat_and_nested_sources() {
    let temp = tempfile::tempdir().expect("create temp dir");
    for side in ["lr", "hr"] {
        write_gradient(&temp.path().join(format!("{side}/a.png")), 8, 8);
        write_gradient(&temp.path().join(format!("{side}/set1/a.png")), 8, 8);
    }

    let config = ConvertConfig {
        recursive: true,
        key_includes_subdir: true,
        ..config(
            temp.path().join("hr"),
            Some(temp.path().join("lr")),
            temp.path().join("out"),
        )
    };
    let summary = run(config).await.expect("keys match on both sides");

    assert_eq!(summary.pairs_processed, 2);
    assert_eq!(
        tile_names(&temp.path().join("out/y")),
        vec!["a.png", "set1.a.png"]
    );
    assert_eq!(
        tile_names(&temp.path().join("out/x")),
        vec!["a.png", "set1.a.png"]
    );
}
