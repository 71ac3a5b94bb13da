use std::fs;
use std::path::Path;

use assert_cmd::Command;
use yakvm_core::{BinaryOp, CodeBuilder, CodesMarshaller, Op, Program};

const KEY_HEX: &str = "30313233343536373839616263646566";

/// fn twice(n) { return n * 2 }; twice(21)
fn answer() -> Program {
    let mut b = CodeBuilder::new();
    b.line(1);
    b.function("twice", &["n"], false, |f| {
        f.line(2);
        f.load("n");
        f.push(2i64);
        f.binary(BinaryOp::Mul);
        f.emit(Op::Return);
    });
    b.define("twice");
    b.line(3);
    b.load("twice");
    b.push(21i64);
    b.call(1);
    b.finish()
}

fn write_yakc(dir: &Path, name: &str, marshaller: &CodesMarshaller) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, marshaller.marshal_program(&answer()).unwrap()).unwrap();
    path
}

fn yakvm() -> Command {
    let mut cmd = Command::cargo_bin("yakvm").unwrap();
    cmd.env_remove("YAKVM_CACHE_DIR").env_remove("YAKVM_TRACE").env_remove("RUST_LOG");
    cmd
}

#[test]
fn run_prints_the_program_result() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_yakc(dir.path(), "answer.yakc", &CodesMarshaller::new());

    let out = yakvm().arg("run").arg(&file).output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "42");
}

#[test]
fn encrypted_files_need_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let key = *b"0123456789abcdef";
    let file = write_yakc(dir.path(), "secret.yakc", &CodesMarshaller::with_key(key));

    let denied = yakvm().arg("run").arg(&file).output().unwrap();
    assert!(!denied.status.success());
    let stderr = String::from_utf8_lossy(&denied.stderr);
    assert!(stderr.contains("YAKVM |"), "{}", stderr);
    assert!(stderr.contains("encrypted yakc requires a key"), "{}", stderr);

    let ok = yakvm().args(["run", "--key", KEY_HEX]).arg(&file).output().unwrap();
    assert!(ok.status.success(), "{}", String::from_utf8_lossy(&ok.stderr));
    assert_eq!(String::from_utf8_lossy(&ok.stdout).trim(), "42");
}

#[test]
fn source_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("plain.yak");
    fs::write(&file, "println(1)").unwrap();

    let out = yakvm().arg("run").arg(&file).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("is not a .yakc file"));
}

#[test]
fn missing_files_are_reported_with_their_path() {
    let out = yakvm().args(["run", "/definitely/not/here.yakc"]).output().unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("yakvm.script"), "{}", stderr);
    assert!(stderr.contains("/definitely/not/here.yakc"), "{}", stderr);
}

#[test]
fn disasm_lists_main_and_nested_functions() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_yakc(dir.path(), "answer.yakc", &CodesMarshaller::new());

    let out = yakvm().arg("disasm").arg(&file).output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let listing = String::from_utf8_lossy(&out.stdout);
    assert!(listing.contains("<main>"), "{}", listing);
    assert!(listing.contains("fn twice (1 param(s))"), "{}", listing);
    assert!(listing.contains("BINARY *"), "{}", listing);
    assert!(listing.contains("twice"), "{}", listing);
}

#[test]
fn cache_info_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    for hash in ["aa", "bb"] {
        fs::write(dir.path().join(format!("{}.yakc", hash)), b"YC").unwrap();
        fs::write(dir.path().join(format!("{}.yakc.sha256", hash)), b"00").unwrap();
    }
    fs::write(dir.path().join("keep.txt"), b"unrelated").unwrap();

    let info = yakvm().args(["cache", "info", "--json", "--dir"]).arg(dir.path()).output().unwrap();
    assert!(info.status.success());
    let json: serde_json::Value = serde_json::from_slice(&info.stdout).unwrap();
    assert_eq!(json["entries"], 2);
    assert_eq!(json["bytes"], 4);

    let clear = yakvm().args(["cache", "clear", "--dir"]).arg(dir.path()).output().unwrap();
    assert!(clear.status.success());
    assert_eq!(String::from_utf8_lossy(&clear.stdout).trim(), "removed 4 file(s)");
    assert!(dir.path().join("keep.txt").exists());
    assert!(!dir.path().join("aa.yakc").exists());
}

#[test]
fn cache_commands_need_a_directory() {
    let out = yakvm().args(["cache", "clear"]).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("no cache directory"));
}
