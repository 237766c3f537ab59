//! Integration tests for the `synvm` binary

use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use synvm::instruction::Instruction;
use tempfile::tempdir;

fn synvm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_synvm"))
}

fn write_image(path: &std::path::Path, source: &str) {
    let words = Instruction::assemble(source).unwrap();
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    fs::write(path, bytes).unwrap();
}

const ECHO: &str = "
    loop: in r0
          out r0
          eq r1 r0 '.'
          jf r1 loop
          halt
";

#[test]
fn test_run_headless_with_stdin() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("echo.bin");
    write_image(&image, ECHO);

    let mut child = synvm()
        .args(["run", "--headless"])
        .arg(&image)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"hello.\n").unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello.");
}

#[test]
fn test_run_with_config_script() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("echo.bin");
    write_image(&image, ECHO);
    let config = dir.path().join("run.toml");
    fs::write(&config, "[input]\nscript = [\"ab\", \"c.\"]\n").unwrap();

    let output = synvm()
        .args(["run", "--headless", "--config"])
        .arg(&config)
        .arg(&image)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "ab\nc.");
}

#[test]
fn test_run_hex_sequence_error_exit() {
    // mod r0 1 0
    let output = synvm()
        .args(["run", "--headless", "--hex", "000b800000010000"])
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("MOD by zero"));
}

#[test]
fn test_disasm_and_strings() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("prog.bin");
    write_image(&image, "set r0 msg; halt; msg: data 3 'a' 'b' 'c'");

    let output = synvm().arg("disasm").arg(&image).args(["--count", "2"]).output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert_eq!(text.lines().collect::<Vec<_>>(), vec!["0000: SET  R0 0004", "0003: HALT"]);

    let output = synvm().arg("disasm").arg(&image).args(["--strings", "3"]).output().unwrap();
    assert!(String::from_utf8_lossy(&output.stdout).contains("0004: \"abc\""));
}

#[test]
fn test_patch_then_run() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("prog.bin");
    let patched = dir.path().join("patched.bin");
    write_image(&image, "out 'x'; halt; noop");

    let output = synvm()
        .arg("patch")
        .arg(&image)
        .arg("-o")
        .arg(&patched)
        .args(["-s", "0001:0079", "-a", "0002:out 'z'"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let output = synvm()
        .args(["run", "--headless"])
        .arg(&patched)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout), "yz");
}

#[test]
fn test_decode_string() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("strings.bin");
    let key = 0x21u16;
    let mut words = vec![0u16; 0x20];
    words[0x10] = 4;
    for (i, c) in "door".chars().enumerate() {
        words[0x11 + i] = c as u16 ^ key;
    }
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    fs::write(&image, bytes).unwrap();

    let output = synvm()
        .arg("decode")
        .arg(&image)
        .args(["--table", "10", "--key", "21"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "door");
}

#[test]
fn test_route() {
    let output = synvm().arg("route").output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.lines().next().unwrap().ends_with("(12 steps)"));
    assert_eq!(text.lines().count(), 13);

    let output = synvm()
        .args(["route", "--check", "N,E,E,N,W,S,E,E,W,N,N,E"])
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&output.stdout).contains("weight 30, at the door"));
}
