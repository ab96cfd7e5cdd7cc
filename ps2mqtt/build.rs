use protobuf_codegen::Codegen;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_files = ["src/protos/powerstream.proto"];

    for path in &proto_files {
        println!("cargo:rerun-if-changed={path}");
    }

    // generated sources and their mod.rs land in $OUT_DIR/ecoflow
    Codegen::new()
        .pure()
        .cargo_out_dir("ecoflow")
        .inputs(proto_files)
        .include("src/protos")
        .run_from_script();

    Ok(())
}
