use predicates::prelude::*;
use rstest::rstest;
use serde_json::Value;

mod common;

const ALPINE_REQUEST: &str = r#"{
    "name": "web",
    "image": "docker.io/library/alpine:latest",
    "command": ["/bin/sh", "-c", "sleep infinity"]
}"#;

fn option<'a>(result: &'a Value, name: &str) -> Option<&'a Value> {
    result["options"]
        .as_array()?
        .iter()
        .find(|o| o["option"] == name)
}

#[test]
fn test_compile_basic() {
    let mut ctx = common::specgen();
    let request = ctx.write("request.json", ALPINE_REQUEST);

    let output = ctx
        .cmd
        .args(["compile", "--request"])
        .arg(&request)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let result = common::stdout_json(&output);
    assert_eq!(result["spec"]["ociVersion"], "1.0.2");
    assert_eq!(result["spec"]["hostname"], "web");
    assert_eq!(
        result["spec"]["process"]["args"],
        serde_json::json!(["/bin/sh", "-c", "sleep infinity"])
    );
    assert_eq!(option(&result, "name").unwrap()["value"], "web");
    assert_eq!(option(&result, "stop_timeout").unwrap()["value"], 30);
    assert_eq!(option(&result, "log_driver").unwrap()["value"], "journald");
    assert!(result["warnings"].as_array().unwrap().is_empty());
}

#[test]
fn test_compile_yaml_request_with_image() {
    let mut ctx = common::specgen();
    let request = ctx.write(
        "request.yaml",
        "name: proxy\nimage: docker.io/library/nginx:latest\npublish_exposed_ports: true\n",
    );
    let image = ctx.write(
        "image.json",
        r#"{
            "name": "docker.io/library/nginx:latest",
            "entrypoint": ["/docker-entrypoint.sh"],
            "cmd": ["nginx", "-g", "daemon off;"],
            "working_dir": "/usr/share/nginx/html",
            "exposed_ports": ["80/tcp"],
            "stop_signal": "SIGQUIT"
        }"#,
    );

    let output = ctx
        .cmd
        .args(["compile", "--request"])
        .arg(&request)
        .arg("--image")
        .arg(&image)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let result = common::stdout_json(&output);
    assert_eq!(result["spec"]["process"]["cwd"], "/usr/share/nginx/html");
    assert_eq!(result["spec"]["process"]["args"][0], "/docker-entrypoint.sh");
    assert_eq!(option(&result, "stop_signal").unwrap()["value"], 3);

    let mappings = &option(&result, "net_ns").unwrap()["value"]["port_mappings"];
    assert_eq!(mappings[0]["container_port"], 80);
    assert_ne!(mappings[0]["host_port"], 0);
}

#[test]
fn test_compile_oci_image_config() {
    let mut ctx = common::specgen();
    let request = ctx.write(
        "request.json",
        r#"{"name": "busy", "image": "docker.io/library/busybox:latest"}"#,
    );
    let image = ctx.write(
        "config.json",
        r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/bin", "GREETING=hello"],
                "Cmd": ["sh"],
                "WorkingDir": "/home"
            },
            "rootfs": {"type": "layers", "diff_ids": []}
        }"#,
    );

    let output = ctx
        .cmd
        .args(["compile", "--request"])
        .arg(&request)
        .arg("--oci-image")
        .arg(&image)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let result = common::stdout_json(&output);
    let env = result["spec"]["process"]["env"].as_array().unwrap();
    assert!(env.contains(&Value::from("GREETING=hello")));
    assert_eq!(result["spec"]["process"]["cwd"], "/home");
}

#[test]
fn test_compile_output_file() {
    let mut ctx = common::specgen();
    let request = ctx.write("request.json", ALPINE_REQUEST);
    let out = ctx.path("compiled.json");

    ctx.cmd
        .args(["compile", "--pretty", "--request"])
        .arg(&request)
        .arg("--output")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("compiled.json"));

    let written = std::fs::read_to_string(&out).unwrap();
    assert!(written.contains("\n  \"spec\""));
}

#[test]
fn test_compile_warnings_on_stderr() {
    let mut ctx = common::specgen();
    let request = ctx.write(
        "request.json",
        r#"{
            "name": "hostnet",
            "image": "alpine",
            "command": ["true"],
            "network": ["host"],
            "publish": ["8080:80"]
        }"#,
    );

    ctx.cmd
        .args(["compile", "--request"])
        .arg(&request)
        .assert()
        .success()
        .stderr(predicate::str::contains("Warning:"))
        .stderr(predicate::str::contains("port"));
}

#[rstest]
#[case::image_and_rootfs(
    r#"{"image": "alpine", "rootfs": "/srv/root", "command": ["true"]}"#,
    "mutually exclusive"
)]
#[case::no_command(r#"{"image": "alpine"}"#, "command")]
#[case::privileged_cap_add(
    r#"{"image": "alpine", "command": ["true"], "privileged": true, "cap_add": ["NET_ADMIN"]}"#,
    "additional capabilities"
)]
#[case::bad_port(
    r#"{"image": "alpine", "command": ["true"], "publish": ["80-70"]}"#,
    "port"
)]
fn test_compile_rejects(#[case] request: &str, #[case] message: &str) {
    let mut ctx = common::specgen();
    let path = ctx.write("request.json", request);

    ctx.cmd
        .args(["compile", "--request"])
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::starts_with("Error:"))
        .stderr(predicate::str::contains(message));
}

#[test]
fn test_compile_missing_request() {
    let mut ctx = common::specgen();
    let missing = ctx.path("nope.json");
    ctx.cmd
        .args(["compile", "--request"])
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read request"));
}
