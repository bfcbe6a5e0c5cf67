use super::{Fixture, info, instrument};
use crate::capture::{
    AutoCapture, CaptureContext, CaptureStrategy, DirectoryExtCapture, DirectoryNoExtCapture,
    MultiFileCapture, SingleFileCapture,
};
use crate::config::EmbeddedFileSkipRule;
use crate::logging::Observability;
use crate::test_helpers::{CountingConnector, CountingShare, fast_capture_config};
use crate::types::{CloseoutKind, DatasetType, EvalCode};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn growing_directory_is_not_ready() {
    let fx = Fixture::new();
    let data = fx.file("QC_Mam_01/data.bin", b"first scan");
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut file = std::fs::OpenOptions::new().append(true).open(&data).unwrap();
        file.write_all(b" second scan").unwrap();
    });

    let outcome = DirectoryNoExtCapture::new(fx.ctx.clone())
        .capture(
            &info("QC_Mam_01", "QC_Mam_01", DatasetType::DirectoryNoExt),
            &fx.share.join("QC_Mam_01"),
            &fx.destination("QC_Mam_01"),
            false,
            &instrument("LTQ_FT"),
        )
        .await;
    writer.await.unwrap();

    assert_eq!(outcome.closeout, CloseoutKind::NotReady);
    assert_eq!(outcome.message, "directory size changed");
    assert!(!fx.destination("QC_Mam_01").exists());
    fx.assert_released_once();
}

#[tokio::test]
async fn existing_destination_is_moved_aside_without_resume() {
    let fx = Fixture::new();
    fx.file("QC_Mam_01/data.bin", b"new data");
    let dest = fx.destination("QC_Mam_01");
    std::fs::create_dir_all(&dest).unwrap();
    std::fs::write(dest.join("stale.bin"), b"old data").unwrap();

    let outcome = DirectoryNoExtCapture::new(fx.ctx.clone())
        .capture(
            &info("QC_Mam_01", "QC_Mam_01", DatasetType::DirectoryNoExt),
            &fx.share.join("QC_Mam_01"),
            &dest,
            false,
            &instrument("LTQ_FT"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Success, "outcome: {outcome:?}");
    assert!(dest.join("data.bin").is_file());
    assert!(!dest.join("stale.bin").exists());
    assert!(fx.storage.join("x_QC_Mam_01").join("stale.bin").is_file());
}

#[tokio::test]
async fn resume_keeps_existing_destination_data() {
    let fx = Fixture::new();
    fx.file("QC_Mam_01/data.bin", b"new data");
    let dest = fx.destination("QC_Mam_01");
    std::fs::create_dir_all(&dest).unwrap();
    std::fs::write(dest.join("notes.txt"), b"kept").unwrap();

    let outcome = DirectoryNoExtCapture::new(fx.ctx.clone())
        .capture(
            &info("QC_Mam_01", "QC_Mam_01", DatasetType::DirectoryNoExt),
            &fx.share.join("QC_Mam_01"),
            &dest,
            true,
            &instrument("LTQ_FT"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Success, "outcome: {outcome:?}");
    assert!(dest.join("notes.txt").is_file());
    assert!(dest.join("data.bin").is_file());
    assert!(!fx.storage.join("x_QC_Mam_01").exists());
}

#[tokio::test]
async fn nested_same_named_directory_is_copied_instead() {
    let fx = Fixture::new();
    fx.file("QC_Mam_01.d/QC_Mam_01.d/analysis.baf", b"baf");
    fx.file("QC_Mam_01.d/QC_Mam_01.d/AcqData/MSScan.bin", b"scan");

    let outcome = DirectoryExtCapture::new(fx.ctx.clone())
        .capture(
            &info("QC_Mam_01", "QC_Mam_01.d", DatasetType::DirectoryExt),
            &fx.share.join("QC_Mam_01.d"),
            &fx.destination("QC_Mam_01"),
            false,
            &instrument("Agilent_TOF"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Success, "outcome: {outcome:?}");
    let target = fx.destination("QC_Mam_01").join("QC_Mam_01.d");
    assert!(target.join("analysis.baf").is_file());
    assert!(target.join("AcqData").join("MSScan.bin").is_file());
    assert!(!target.join("QC_Mam_01.d").exists());
}

#[tokio::test]
async fn locked_and_rule_matched_files_are_left_behind() {
    let mut config = fast_capture_config();
    config.embedded_file_rules = vec![EmbeddedFileSkipRule {
        instrument_class_prefix: "IMS_Agilent".to_string(),
        skip_extension: "bin".to_string(),
        container_extension: "uimf".to_string(),
    }];
    let fx = Fixture::with_config(config);
    fx.file("Ecoli_IMS_01/Ecoli_IMS_01.uimf", b"container");
    fx.file("Ecoli_IMS_01/frames.bin", b"raw frames");
    fx.file("Ecoli_IMS_01/Thumbs.db", b"thumbs");
    fx.file("Ecoli_IMS_01/Calibration.ascii", b"");

    let outcome = DirectoryNoExtCapture::new(fx.ctx.clone())
        .capture(
            &info("Ecoli_IMS_01", "Ecoli_IMS_01", DatasetType::DirectoryNoExt),
            &fx.share.join("Ecoli_IMS_01"),
            &fx.destination("Ecoli_IMS_01"),
            false,
            &instrument("IMS_Agilent_TOF"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Success, "outcome: {outcome:?}");
    let dest = fx.destination("Ecoli_IMS_01");
    assert!(dest.join("Ecoli_IMS_01.uimf").is_file());
    assert!(!dest.join("frames.bin").exists());
    assert!(!dest.join("Thumbs.db").exists());
    // Empty-file rule applies to Bruker classes only
    assert!(dest.join("Calibration.ascii").is_file());
}

#[tokio::test]
async fn single_file_is_copied_and_sanitized() {
    let fx = Fixture::new();
    fx.file("QC Mam 01.raw", b"raw spectra");

    let outcome = SingleFileCapture::new(fx.ctx.clone())
        .capture(
            &info("QC_Mam_01", "QC Mam 01.raw", DatasetType::File),
            &fx.share.join("QC Mam 01.raw"),
            &fx.destination("QC_Mam_01"),
            false,
            &instrument("LTQ_FT"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Success, "outcome: {outcome:?}");
    let dest = fx.destination("QC_Mam_01");
    assert_eq!(std::fs::read(dest.join("QC_Mam_01.raw")).unwrap(), b"raw spectra");
    assert!(!dest.join("QC Mam 01.raw").exists());
    fx.assert_released_once();
}

#[tokio::test]
async fn single_file_rejects_a_directory() {
    let fx = Fixture::new();
    fx.dir("QC_Mam_01.raw");

    let outcome = SingleFileCapture::new(fx.ctx.clone())
        .capture(
            &info("QC_Mam_01", "QC_Mam_01.raw", DatasetType::File),
            &fx.share.join("QC_Mam_01.raw"),
            &fx.destination("QC_Mam_01"),
            false,
            &instrument("LTQ_FT"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Failed);
    assert_eq!(outcome.eval_code, EvalCode::FailureDoNotRetry);
    assert!(outcome.message.contains("Expected a file but found a directory"));
}

#[tokio::test]
async fn multi_file_copies_every_sibling_with_the_base_name() {
    let fx = Fixture::new();
    fx.file("Lipid_01.wiff", b"wiff");
    fx.file("Lipid_01.wiff.scan", b"scan");
    fx.file("Lipid_02.wiff", b"other dataset");

    let outcome = MultiFileCapture::new(fx.ctx.clone())
        .capture(
            &info("Lipid_01", "Lipid_01.wiff", DatasetType::MultiFile),
            &fx.share.join("Lipid_01.wiff"),
            &fx.destination("Lipid_01"),
            false,
            &instrument("Sciex_TripleTOF"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Success, "outcome: {outcome:?}");
    let dest = fx.destination("Lipid_01");
    assert!(dest.join("Lipid_01.wiff").is_file());
    assert!(dest.join("Lipid_01.wiff.scan").is_file());
    assert!(!dest.join("Lipid_02.wiff").exists());
}

#[tokio::test]
async fn multi_file_with_one_growing_file_is_not_ready() {
    let fx = Fixture::new();
    fx.file("Lipid_01.wiff", b"wiff");
    let scan = fx.file("Lipid_01.wiff.scan", b"first scans");
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut file = std::fs::OpenOptions::new().append(true).open(&scan).unwrap();
        file.write_all(b" more scans").unwrap();
    });

    let outcome = MultiFileCapture::new(fx.ctx.clone())
        .capture(
            &info("Lipid_01", "Lipid_01.wiff", DatasetType::MultiFile),
            &fx.share.join("Lipid_01.wiff"),
            &fx.destination("Lipid_01"),
            false,
            &instrument("Sciex_TripleTOF"),
        )
        .await;
    writer.await.unwrap();

    assert_eq!(outcome.closeout, CloseoutKind::NotReady, "outcome: {outcome:?}");
    assert_eq!(outcome.message, "file size changed: Lipid_01.wiff.scan");
    assert!(!fx.destination("Lipid_01").exists());
    fx.assert_released_once();
}

#[tokio::test]
async fn multi_file_without_matches_is_not_found() {
    let fx = Fixture::new();
    fx.file("Lipid_02.wiff", b"other dataset");

    let outcome = MultiFileCapture::new(fx.ctx.clone())
        .capture(
            &info("Lipid_01", "Lipid_01.wiff", DatasetType::MultiFile),
            &fx.share.join("Lipid_01.wiff"),
            &fx.destination("Lipid_01"),
            false,
            &instrument("Sciex_TripleTOF"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Failed);
    assert!(outcome.message.starts_with("Source not found"));
}

#[tokio::test]
async fn credential_failure_skips_the_capture_body() {
    let fx = Fixture::new();
    fx.file("QC_Mam_01.raw", b"raw spectra");
    let share = Arc::new(CountingShare::failing("The user name or password is incorrect."));
    let ctx = Arc::new(
        CaptureContext::new(fast_capture_config(), Observability::new())
            .with_shares(Arc::new(CountingConnector(share.clone()))),
    );

    let outcome = SingleFileCapture::new(ctx)
        .capture(
            &info("QC_Mam_01", "QC_Mam_01.raw", DatasetType::File),
            &fx.share.join("QC_Mam_01.raw"),
            &fx.destination("QC_Mam_01"),
            false,
            &instrument("LTQ_FT"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Failed);
    assert!(outcome.eval_message.starts_with("Credential error"));
    assert!(!fx.destination("QC_Mam_01").exists());
    assert_eq!(share.connects(), 1);
    assert_eq!(share.disconnects(), 1);
}

#[tokio::test]
async fn unknown_dataset_type_fails_without_touching_the_share() {
    let fx = Fixture::new();

    let outcome = AutoCapture::new(fx.ctx.clone())
        .capture(
            &info("Mystery_01", "Mystery_01", DatasetType::Unknown),
            &fx.share.join("Mystery_01"),
            &fx.destination("Mystery_01"),
            false,
            &instrument("LTQ_FT"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Failed);
    assert_eq!(outcome.message, "Unknown dataset type for dataset Mystery_01");
    assert_eq!(fx.counter.connects(), 0);
}

#[tokio::test]
async fn auto_capture_dispatches_on_dataset_type() {
    let fx = Fixture::new();
    fx.file("QC_Mam_01.raw", b"raw spectra");

    let outcome = AutoCapture::new(fx.ctx.clone())
        .capture(
            &info("QC_Mam_01", "QC_Mam_01.raw", DatasetType::File),
            &fx.share.join("QC_Mam_01.raw"),
            &fx.destination("QC_Mam_01"),
            false,
            &instrument("LTQ_FT"),
        )
        .await;

    assert_eq!(outcome.closeout, CloseoutKind::Success, "outcome: {outcome:?}");
    assert!(fx.destination("QC_Mam_01").join("QC_Mam_01.raw").is_file());
}
