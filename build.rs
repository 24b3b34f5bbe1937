use std::io::ErrorKind;
use std::path::Path;
use std::{fs, io};

const PROTO_DIR: &str = "./protos/";
const GENERATED_DIR: &str = "./generated/";

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed={}raft.proto", PROTO_DIR);
    build_proto()
}

fn build_proto() -> io::Result<()> {
    create_dir_if_missing(GENERATED_DIR)?;
    tonic_build::configure()
        .out_dir(GENERATED_DIR)
        .compile(&["./protos/raft.proto"], &[PROTO_DIR])
}

fn create_dir_if_missing<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match fs::create_dir(path) {
        Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
        _ => Ok(()),
    }
}
