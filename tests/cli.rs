use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use mcuimg::keys;
use mcuimg::trailer::BOOT_MAGIC;
use mcuimg::verify::{verify_file, VerifyResult};
use mcuimg::{CreateOptions, Image, ImageConfig, ImageError, ImageHeader, VerifyingKey};

fn testdata(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
}

fn mcuimg(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mcuimg"))
        .args(args)
        .output()
        .expect("failed to run mcuimg")
}

fn s(p: &Path) -> &str {
    p.to_str().unwrap()
}

#[test]
fn padded_rsa_image_through_files() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("app.bin");
    let output = dir.path().join("app.signed.bin");
    fs::write(&input, vec![0u8; 1024]).unwrap();

    let config = ImageConfig::builder()
        .header_size(0x400)
        .pad_header(true)
        .slot_size(0x10000)
        .align(16)
        .confirm(true)
        .build();
    let key = keys::load_signing_key(testdata("rsa-2048.pem")).unwrap();
    let mut image = Image::new(config).unwrap();
    image.load(&input).unwrap();
    image.create(&CreateOptions::with_key(key.as_ref())).unwrap();
    image.save(&output).unwrap();

    let out = fs::read(&output).unwrap();
    assert_eq!(out.len(), 0x10000);
    let (header, _) = ImageHeader::detect(&out).unwrap();
    assert_eq!(header.img_size, 1024);
    assert_eq!(&out[out.len() - 16..], &BOOT_MAGIC);
    assert_eq!(out[out.len() - 24], 0x01);

    let public = keys::load_verifying_key(testdata("rsa-2048-pub.pem")).unwrap();
    let v = verify_file(&output, &[public.as_ref()]).unwrap();
    assert_eq!(v.result, VerifyResult::Ok);
}

#[test]
fn empty_input_and_hex_output_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("empty.bin");
    fs::write(&input, b"").unwrap();

    let mut image = Image::new(ImageConfig::builder().pad_header(true).build()).unwrap();
    assert!(matches!(image.load(&input), Err(ImageError::EmptyInput(_))));

    fs::write(&input, b"payload").unwrap();
    image.load(&input).unwrap();
    image.create(&CreateOptions::default()).unwrap();
    assert!(matches!(
        image.save(dir.path().join("out.hex")),
        Err(ImageError::Usage(_))
    ));
}

#[test]
fn cli_sign_verify_edit() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("app.bin");
    let signed = dir.path().join("signed.bin");
    fs::write(&input, vec![0x42u8; 3000]).unwrap();

    let p256 = testdata("ec-p256.pem");
    let out = mcuimg(&[
        "sign",
        "-k",
        s(&p256),
        "--key-id",
        "1",
        "--image-version",
        "1.2.3+4",
        "-H",
        "0x200",
        "--pad-header",
        "-S",
        "0x8000",
        "--align",
        "4",
        "--pad",
        "--pad-sig",
        "-s",
        "auto",
        "--custom-tlv",
        "0xa0",
        "0xdeadbeef",
        s(&input),
        s(&signed),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(fs::metadata(&signed).unwrap().len(), 0x8000);

    let out = mcuimg(&["verify", "-k", s(&testdata("ec-p256-pub.pem")), s(&signed)]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("1.2.3+4"), "{stdout}");

    // A key of the right family that did not sign.
    let out = mcuimg(&["verify", "-k", s(&testdata("rsa-2048.pem")), s(&signed)]);
    assert_eq!(out.status.code(), Some(4));

    let before = fs::read(&signed).unwrap();
    let appended = dir.path().join("appended.bin");
    let out = mcuimg(&[
        "sign-append",
        "-k",
        s(&testdata("ed25519.pem")),
        "--key-id",
        "2",
        s(&signed),
        s(&appended),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(fs::read(&appended).unwrap().len(), before.len());

    let ed = keys::load_verifying_key(testdata("ed25519.pem")).unwrap();
    let keys: [&dyn VerifyingKey; 1] = [ed.as_ref()];
    assert!(verify_file(&appended, &keys).unwrap().is_ok());

    let out = mcuimg(&["sign-remove", "--key-id", "2", s(&appended)]);
    assert!(out.status.success());
    assert_eq!(fs::read(&appended).unwrap(), before);

    let out = mcuimg(&["sign-remove", "--key-id", "9", s(&appended)]);
    assert_eq!(out.status.code(), Some(2));

    let out = mcuimg(&["dumpinfo", s(&signed)]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("SEC_CNT"), "{stdout}");
    assert!(stdout.contains("0x00a0"), "{stdout}");
    assert!(stdout.contains("deadbeef"), "{stdout}");
}

#[test]
fn cli_getpub_matches_key() {
    let out = mcuimg(&["getpub", "-k", s(&testdata("ec-p256.pem"))]);
    assert!(out.status.success());
    let printed = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let key = keys::load_verifying_key(testdata("ec-p256-pub.pem")).unwrap();
    assert_eq!(printed, hex::encode(key.public_bytes().unwrap()));
}

#[test]
fn cli_reports_slot_overflow() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("big.bin");
    fs::write(&input, vec![1u8; 0x1000]).unwrap();
    let out = mcuimg(&[
        "sign",
        "--pad-header",
        "-S",
        "0x1000",
        "--pad",
        s(&input),
        s(&dir.path().join("out.bin")),
    ]);
    assert_eq!(out.status.code(), Some(5));
    assert!(!dir.path().join("out.bin").exists());
}
