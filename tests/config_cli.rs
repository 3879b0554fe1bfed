use kestrel_pbr::cli::CliOverrides;
use kestrel_pbr::config::AppConfig;
use kestrel_pbr::renderer::DebugOverlay;
use kestrel_pbr::PipelineError;
use std::fs;
use tempfile::tempdir;

#[test]
fn bundled_config_parses_and_validates() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/app.json");
    let cfg = AppConfig::load(path).expect("bundled config");
    cfg.validate().expect("bundled config is valid");
    assert_eq!(cfg.renderer.shadow.cascade_count, 4);
    assert!(cfg.renderer.shadow.fit_to_scene_depth);
    assert!(cfg.renderer.ao.enabled);
}

#[test]
fn cli_overrides_apply_on_top_of_file_config() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("app.json");
    fs::write(
        &path,
        r#"{ "window": { "title": "t", "width": 640, "height": 480, "vsync": true, "fullscreen": false } }"#,
    )
    .expect("write config");

    let args = ["app", "--config", path.to_str().expect("utf8 path"), "--width", "1024", "--no-ao"];
    let cli = CliOverrides::parse(args).expect("parse");
    let mut cfg = AppConfig::load(cli.config_path()).expect("load");
    cfg.apply_overrides(&cli.config_overrides());

    assert_eq!(cfg.window.width, 1024);
    assert_eq!(cfg.window.height, 480);
    assert!(cfg.window.vsync);
    assert!(!cfg.renderer.ao.enabled);
    assert_eq!(cli.debug_overlay(), None);
    cfg.validate().expect("valid");
}

#[test]
fn missing_config_falls_back_to_defaults() {
    let dir = tempdir().expect("tempdir");
    let cfg = AppConfig::load_or_default(dir.path().join("absent.json"));
    assert_eq!(cfg.window.width, 1280);
    assert_eq!(cfg.renderer.shadow.resolution, 2048);
}

#[test]
fn invalid_shadow_settings_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("bad.json");
    fs::write(
        &path,
        r#"{
            "window": { "title": "t", "width": 640, "height": 480, "vsync": true, "fullscreen": false },
            "renderer": { "shadow": { "cascade_count": 6 } }
        }"#,
    )
    .expect("write config");
    let cfg = AppConfig::load(&path).expect("parses");
    assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(msg)) if msg.contains("cascade_count")));
}

#[test]
fn debug_overlay_flag_accepts_every_mode() {
    for (value, expected) in [("none", DebugOverlay::None), ("depth", DebugOverlay::Depth), ("AO", DebugOverlay::Ao)] {
        let cli = CliOverrides::parse(["app", "--debug-overlay", value]).expect("parse");
        assert_eq!(cli.debug_overlay(), Some(expected));
    }
}
