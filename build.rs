/// Build flow:
///
/// 1. Refuse non-64-bit targets (descriptor addresses are 64-bit virtual addresses).
/// 2. With the `verbs` feature, locate `libibverbs` and `librdmacm` through
///    `pkg-config` and generate bindings for both headers.
fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rdread` currently only supports 64-bit platforms");
    }

    #[cfg(feature = "verbs")]
    verbs::main();
}

#[cfg(feature = "verbs")]
mod verbs {
    use std::env;
    use std::path::Path;

    /// Probe one rdma-core library, returning its include directories.
    fn probe(lib: &str, min_version: &str) -> Vec<String> {
        let lib = pkg_config::Config::new()
            .atleast_version(min_version)
            .statik(false)
            .probe(lib)
            .unwrap_or_else(|e| panic!("cannot find {} via pkg-config: {}", lib, e));
        lib.include_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    pub(super) fn main() {
        println!("cargo:rerun-if-changed=src/bindings/verbs.h");

        let mut include_dirs = probe("libibverbs", "1.8.28");
        include_dirs.extend(probe("librdmacm", "1.2.28"));
        include_dirs.sort();
        include_dirs.dedup();

        let include_args = include_dirs.iter().map(|p| format!("-I{}", p));
        let bindings = bindgen::builder()
            .clang_args(include_args)
            .header("src/bindings/verbs.h")
            .allowlist_function("ibv_.*")
            .allowlist_function("rdma_.*")
            .allowlist_type("ibv_.*")
            .allowlist_type("rdma_.*")
            .opaque_type("pthread_.*")
            .blocklist_type("ibv_send_wr")
            .blocklist_type("ibv_wc")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_send_flags")
            .bitfield_enum("ibv_wc_flags")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_wr_opcode")
            .constified_enum_module("rdma_cm_event_type")
            .constified_enum_module("rdma_port_space")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(false)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").unwrap();
        let dest = Path::new(&out_dir).join("verbs_bindings.rs");
        bindings
            .write_to_file(dest)
            .expect("failed to write bindings");
    }
}
