fn main() {
    protobuf_codegen::Codegen::new()
        .pure()
        .include("src/cast")
        .input("src/cast/cast_channel.proto")
        .cargo_out_dir("protos")
        .run_from_script();
}
