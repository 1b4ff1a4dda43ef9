//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Build metadata emission for version reporting."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // No fail_on_error: tarball builds without git emit placeholder values.
    EmitBuilder::builder()
        .all_build()
        .all_cargo()
        .all_git()
        .emit()?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
