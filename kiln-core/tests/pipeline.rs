#![cfg(unix)]

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use common::*;
use kiln_aio::checksum::{sha256_bytes, sha256_file};
use kiln_common::error::KilnError;
use kiln_common::model::artifact::{ReleaseLayout, RECEIPT_FILE_NAME};
use kiln_common::model::formula::BuildPhase;
use kiln_common::pipeline::{PipelineEvent, PipelineState};
use kiln_core::fetch::cache_path_for;
use kiln_core::{CancelSignal, InvocationKind};

use PipelineState::*;

#[tokio::test]
async fn installs_a_flat_release_end_to_end() {
    let h = Harness::new();
    let mut r = record("qvm-ffmpeg", "0.0.0-test2-g", &cmake_project("qvm-ffmpeg"));
    r.caveats = Some("Config lives at {share}/qvm-ffmpeg/config.json".to_string());
    let target = h.publish(r, cmake_project("qvm-ffmpeg"));
    let pipeline = h.pipeline();
    let mut rx = pipeline.subscribe();

    let artifact = pipeline.install_package(Arc::clone(&target)).await.unwrap();

    let keg = h.config.formula_keg_path("qvm-ffmpeg", "0.0.0-test2-g");
    assert_eq!(artifact.keg_path, keg);
    assert_eq!(artifact.layout, ReleaseLayout::Flat);
    assert_eq!(
        artifact.files,
        vec![PathBuf::from("bin/qvm-ffmpeg"), PathBuf::from("share/qvm-ffmpeg/README")]
    );
    assert!(artifact.self_test_passed());
    assert!(keg.join(RECEIPT_FILE_NAME).is_file());
    assert_eq!(fs::read_link(&artifact.opt_path).unwrap(), keg);
    assert_eq!(
        artifact.linked_executables,
        vec![h.config.bin_dir().join("qvm-ffmpeg")]
    );
    assert_eq!(
        artifact.caveats.as_deref(),
        Some(format!("Config lives at {}/share/qvm-ffmpeg/config.json", keg.display()).as_str())
    );

    let events = drain(&mut rx);
    assert_eq!(
        states_for(&events, "qvm-ffmpeg"),
        vec![Pending, Fetching, Verifying, Configuring, Building, Installing, Installed]
    );
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::JobSuccess { target_id, .. } if target_id == "qvm-ffmpeg")));

    assert_eq!(
        h.runner.phases(),
        vec![
            InvocationKind::Step(BuildPhase::Configure),
            InvocationKind::Step(BuildPhase::Build),
            InvocationKind::Step(BuildPhase::Install),
            InvocationKind::SelfTest,
        ]
    );
    let invocations = h.runner.invocations();
    let configure = &invocations[0];
    assert!(configure
        .args
        .contains(&format!("-DCMAKE_INSTALL_PREFIX={}", keg.display())));
    assert!(configure.args.contains(&"-DCMAKE_BUILD_TYPE=Release".to_string()));
    assert_eq!(configure.env.get("MAKEFLAGS").map(String::as_str), Some("-j2"));
    assert_eq!(h.runner.source_listings()[0][0], PathBuf::from("CMakeLists.txt"));
    assert_eq!(invocations[3].program, keg.join("bin/qvm-ffmpeg").display().to_string());
}

#[tokio::test]
async fn embedded_data_is_unpacked_before_configure() {
    let h = Harness::new();
    let data = plain_tar(&[
        ("assets/fonts/Amiri.ttf", b"font bytes".as_slice()),
        ("assets/audio/001.mp3", b"mp3".as_slice()),
    ]);
    let archive = source_tarball(
        "qvm-ffmpeg-v0.0.0-test2-g",
        &[("CMakeLists.txt", b"project(qvm)\n".as_slice()), ("data.tar", data.as_slice())],
    );
    let target = h.publish(record("qvm-ffmpeg", "0.0.0-test2-g", &archive), archive);
    let pipeline = h.pipeline();
    let mut rx = pipeline.subscribe();

    let artifact = pipeline.install_package(target).await.unwrap();

    assert_eq!(
        artifact.layout,
        ReleaseLayout::WithEmbeddedData {
            member: "data.tar".to_string()
        }
    );
    assert_eq!(
        states_for(&drain(&mut rx), "qvm-ffmpeg"),
        vec![Pending, Fetching, Verifying, Unpacking, Configuring, Building, Installing, Installed]
    );
    let listing = &h.runner.source_listings()[0];
    assert!(listing.contains(&PathBuf::from("assets/fonts/Amiri.ttf")));
    assert!(listing.contains(&PathBuf::from("assets/audio/001.mp3")));
}

#[tokio::test]
async fn digest_mismatch_never_extracts_or_builds() {
    let h = Harness::new();
    let served = cmake_project("hello");
    let mut r = record("hello", "2.12.1", &served);
    r.sha256 = sha256_bytes(b"what the formula author uploaded");
    let expected = r.sha256.clone();
    let target = h.publish(r, served.clone());

    let err = h.pipeline().install_package(target).await.unwrap_err();

    assert_eq!(err.state, Verifying);
    match &err.source {
        KilnError::Integrity { expected: e, actual } => {
            assert_eq!(e, &expected);
            assert_eq!(actual, &sha256_bytes(&served));
        }
        other => panic!("expected an integrity error, got {other}"),
    }
    assert!(h.runner.invocations().is_empty());
    let downloads: Vec<_> = fs::read_dir(h.config.downloads_dir()).unwrap().collect();
    assert!(downloads.is_empty(), "rejected artifact was kept");
    let work_trees = fs::read_dir(h.config.tmp_dir()).map(|d| d.count()).unwrap_or(0);
    assert_eq!(work_trees, 0);
    assert!(!h.config.formula_keg_path("hello", "2.12.1").exists());
}

#[tokio::test]
async fn fetch_failure_leaves_no_download_and_runs_nothing() {
    let h = Harness::new();
    let archive = cmake_project("hello");
    // Published but never served, so the fetcher answers 404.
    let target = h.formulary.publish(record("hello", "2.12.1", &archive)).unwrap();

    let err = h.pipeline().install_package(target).await.unwrap_err();

    assert_eq!(err.state, Fetching);
    match &err.source {
        KilnError::Fetch { url, reason } => {
            assert_eq!(url, &url_for("hello", "2.12.1"));
            assert!(reason.contains("404"), "{reason}");
        }
        other => panic!("expected a fetch error, got {other}"),
    }
    assert!(err.to_string().starts_with("fetching failed for hello"));
    assert_eq!(h.fetcher.requests(), vec![url_for("hello", "2.12.1")]);
    assert!(h.runner.invocations().is_empty());
    let downloads = fs::read_dir(h.config.downloads_dir()).map(|d| d.count()).unwrap_or(0);
    assert_eq!(downloads, 0, "partial download was kept");
    assert!(!h.config.formula_keg_path("hello", "2.12.1").exists());
}

#[tokio::test]
async fn path_like_version_is_refused_before_touching_the_cellar() {
    let h = Harness::new();
    let existing = h.package("hello", &[], &[]);
    h.pipeline().install_package(existing).await.unwrap();
    let keg = h.config.formula_keg_path("hello", "1.0.0");

    let archive = cmake_project("hello");
    let err = h.formulary.publish(record("hello", "..", &archive)).unwrap_err();

    assert!(matches!(err, KilnError::InvalidFormula { .. }), "{err}");
    assert!(keg.exists());
    assert_eq!(h.formulary.load_formula("hello").unwrap().version, "1.0.0");
}

#[tokio::test]
async fn kept_build_tree_survives_the_install() {
    let mut h = Harness::new();
    h.config.keep_build_dir = true;
    let target = h.package("hello", &[], &[]);

    h.pipeline().install_package(target).await.unwrap();

    let kept: Vec<PathBuf> = fs::read_dir(h.config.tmp_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(kept.len(), 1);
    assert!(kept[0].join("source/CMakeLists.txt").is_file());
}

#[tokio::test]
async fn unresolvable_dependency_fails_before_any_download() {
    let h = Harness::new();
    let target = h.package("qvm-ffmpeg", &["cmake"], &["ffmpeg"]);

    let err = h.pipeline().install_package(target).await.unwrap_err();

    assert_eq!(err.state, Pending);
    assert!(matches!(err.source, KilnError::DependencyResolution(_)));
    assert!(err.to_string().starts_with("pending failed for qvm-ffmpeg"));
    assert!(h.fetcher.requests().is_empty());
}

#[tokio::test]
async fn cycle_is_reported_before_any_download() {
    let h = Harness::new();
    h.package("libass", &[], &["harfbuzz"]);
    h.package("harfbuzz", &[], &["libass"]);
    let target = h.formulary.load_formula("libass").unwrap();

    let err = h.pipeline().install_package(target).await.unwrap_err();

    assert_eq!(err.state, Pending);
    assert!(err.source.to_string().contains("libass -> harfbuzz -> libass"));
    assert!(h.fetcher.requests().is_empty());
}

#[tokio::test]
async fn failing_self_test_is_a_warning_not_a_rollback() {
    let h = Harness::new();
    let target = h.package("qvm-ffmpeg", &[], &[]);
    h.runner.fail_self_test(127, "quran-video-maker: missing libavcodec");
    let pipeline = h.pipeline();
    let mut rx = pipeline.subscribe();

    let artifact = pipeline.install_package(target).await.unwrap();

    assert!(!artifact.self_test_passed());
    match &artifact.verification_errors[..] {
        [KilnError::Verification { code, output }] => {
            assert_eq!(*code, Some(127));
            assert!(output.contains("missing libavcodec"));
        }
        other => panic!("unexpected verification errors: {other:?}"),
    }
    assert!(artifact.keg_path.join("bin/qvm-ffmpeg").is_file());
    let events = drain(&mut rx);
    assert_eq!(states_for(&events, "qvm-ffmpeg").last(), Some(&Installed));
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::LogWarn { message, .. } if message.contains("self-test"))));
}

#[tokio::test]
async fn self_test_can_be_disabled() {
    let mut h = Harness::new();
    h.config.skip_test = true;
    let target = h.package("hello", &[], &[]);

    let artifact = h.pipeline().install_package(target).await.unwrap();

    assert!(artifact.self_test_passed());
    assert!(!h.runner.phases().contains(&InvocationKind::SelfTest));
}

#[tokio::test]
async fn reinstalling_is_idempotent_and_uses_the_cache() {
    let h = Harness::new();
    let target = h.package("hello", &[], &[]);
    let pipeline = h.pipeline();

    let first = pipeline.install_package(Arc::clone(&target)).await.unwrap();
    let mut rx = pipeline.subscribe();
    let second = pipeline.install_package(target).await.unwrap();

    assert_eq!(first.files, second.files);
    assert_eq!(first.keg_path, second.keg_path);
    assert!(second.warnings.is_empty(), "own links must be replaced silently");
    assert_eq!(h.fetcher.requests().len(), 1);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, PipelineEvent::DownloadCached { .. })));
}

#[tokio::test]
async fn build_failure_reports_phase_code_and_output() {
    let h = Harness::new();
    let target = h.package("hello", &[], &[]);
    h.runner.fail_phase(
        BuildPhase::Build,
        2,
        "make[2]: *** [CMakeFiles/hello.dir/all] Error 1",
        "hello.c:3: undefined reference to `gettext'",
    );

    let err = h.pipeline().install_package(target).await.unwrap_err();

    assert_eq!(err.state, Building);
    match &err.source {
        KilnError::Build { phase, code, stdout, stderr } => {
            assert_eq!(*phase, BuildPhase::Build);
            assert_eq!(*code, Some(2));
            assert_eq!(stdout, "make[2]: *** [CMakeFiles/hello.dir/all] Error 1");
            assert_eq!(stderr, "hello.c:3: undefined reference to `gettext'");
        }
        other => panic!("expected a build error, got {other}"),
    }
    assert!(!h.runner.phases().contains(&InvocationKind::Step(BuildPhase::Install)));
    assert!(!h.config.formula_keg_path("hello", "1.0.0").exists());
}

#[tokio::test]
async fn empty_keg_is_an_install_error_and_is_removed() {
    let h = Harness::new();
    let target = h.package("hello", &[], &[]);
    h.runner.install_nothing();

    let err = h.pipeline().install_package(target).await.unwrap_err();

    assert_eq!(err.state, Installing);
    assert!(matches!(err.source, KilnError::Install(_)));
    assert!(!h.config.formula_keg_path("hello", "1.0.0").exists());
    assert!(!h.config.formula_opt_path("hello").exists());
}

#[tokio::test]
async fn cancellation_stops_at_the_next_phase_boundary() {
    let h = Harness::new();
    let target = h.package("hello", &[], &[]);
    let signal = CancelSignal::new();
    h.runner.cancel_after(BuildPhase::Configure, signal.clone());

    let err = h
        .pipeline()
        .with_cancel(signal)
        .install_package(target)
        .await
        .unwrap_err();

    assert_eq!(err.state, Building);
    assert!(matches!(&err.source, KilnError::Cancelled(s) if s == "building"));
    assert_eq!(
        h.runner.phases(),
        vec![InvocationKind::Step(BuildPhase::Configure)]
    );
}

#[tokio::test]
async fn stale_cached_archive_is_downloaded_again() {
    let h = Harness::new();
    let target = h.package("hello", &[], &[]);
    let cached = cache_path_for(&h.config.downloads_dir(), &target);
    fs::create_dir_all(cached.parent().unwrap()).unwrap();
    fs::write(&cached, b"truncated garbage from an earlier run").unwrap();

    h.pipeline().install_package(Arc::clone(&target)).await.unwrap();

    assert_eq!(h.fetcher.requests(), vec![target.url.clone()]);
    assert_eq!(sha256_file(&cached).unwrap(), target.sha256);
}

#[tokio::test]
async fn missing_dependencies_install_first_in_order() {
    let h = Harness::new();
    h.package("freetype", &[], &[]);
    h.package("libass", &[], &["freetype"]);
    let target = h.package("qvm-ffmpeg", &["cmake"], &["libass", "freetype"]);
    // Already in the cellar; never fetched.
    fs::create_dir_all(h.config.formula_keg_path("cmake", "3.31.1").join("bin")).unwrap();

    let pipeline = h.pipeline();
    let mut rx = pipeline.subscribe();
    let artifact = pipeline.install_package(target).await.unwrap();

    assert_eq!(
        h.fetcher.requests(),
        vec![
            url_for("freetype", "1.0.0"),
            url_for("libass", "1.0.0"),
            url_for("qvm-ffmpeg", "1.0.0"),
        ]
    );
    for name in ["freetype", "libass"] {
        assert!(h.config.formula_keg_path(name, "1.0.0").join(RECEIPT_FILE_NAME).is_file());
        assert!(h.config.formula_opt_path(name).exists());
    }
    assert_eq!(artifact.name, "qvm-ffmpeg");

    let events = drain(&mut rx);
    let planned: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::DependencyPlanned { dependency, .. } => Some(dependency.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(planned, vec!["freetype", "libass"]);
    assert_eq!(states_for(&events, "libass").last(), Some(&Installed));

    let target_configure = h
        .runner
        .invocations()
        .into_iter()
        .filter(|i| i.kind == InvocationKind::Step(BuildPhase::Configure))
        .last()
        .unwrap();
    let pkg_config = target_configure.env.get("PKG_CONFIG_PATH").unwrap();
    assert!(pkg_config.contains("opt/libass/lib/pkgconfig"));
    assert!(pkg_config.contains("opt/cmake/lib/pkgconfig"));
    assert!(target_configure
        .args
        .iter()
        .any(|a| a.starts_with("-DCMAKE_PREFIX_PATH=") && a.contains("opt/freetype")));
}

#[tokio::test]
async fn failed_dependency_aborts_the_target() {
    let h = Harness::new();
    let good = cmake_project("freetype");
    let mut broken = record("freetype", "2.13.3", &good);
    broken.sha256 = sha256_bytes(b"something else");
    h.publish(broken, good);
    let target = h.package("libass", &[], &["freetype"]);

    let err = h.pipeline().install_package(target).await.unwrap_err();

    assert_eq!(err.state, Pending);
    let message = err.source.to_string();
    assert!(message.contains("dependency 'freetype' failed to install"));
    assert!(message.contains("Checksum Mismatch"));
    assert_eq!(h.fetcher.requests(), vec![url_for("freetype", "2.13.3")]);
}

#[tokio::test]
async fn free_function_resolves_against_the_prefix_formulary() {
    let root = tempfile::tempdir().unwrap();
    let mut r = record("qvm-ffmpeg", "0.0.0-test2-g", b"archive");
    r.runtime_dependencies = vec!["ffmpeg".to_string()];

    let err = kiln_core::install_package(r, root.path()).await.unwrap_err();

    assert_eq!(err.state, Pending);
    assert!(err.source.to_string().contains("'ffmpeg' (required by 'qvm-ffmpeg')"));
}
