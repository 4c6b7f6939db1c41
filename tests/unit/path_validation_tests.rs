use std::path::Path;

use exthost_bridge::services::host::workspace_path;
use exthost_bridge::AppError;

#[test]
fn allows_path_inside_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();

    let validated = workspace_path(root, Path::new("src/lib.rs")).expect("path valid");

    let canonical_root = root.canonicalize().expect("canonicalize root");
    assert!(validated.starts_with(&canonical_root));
    assert!(validated.ends_with(Path::new("src/lib.rs")));
}

#[test]
fn rejects_traversal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = workspace_path(temp.path(), Path::new("../secret.txt"));
    assert!(matches!(result, Err(AppError::PathViolation(_))));
}

#[test]
fn rejects_deep_traversal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = workspace_path(temp.path(), Path::new("src/../../secret.txt"));
    assert!(result.is_err());
}

#[test]
fn inner_parent_segments_are_normalised() {
    let temp = tempfile::tempdir().expect("tempdir");
    let validated =
        workspace_path(temp.path(), Path::new("./src/../docs/readme.md")).expect("path valid");
    assert!(validated.ends_with("docs/readme.md"));
}

#[test]
fn absolute_path_inside_root_is_accepted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical");
    std::fs::write(root.join("a.txt"), b"a").expect("write");

    let validated = workspace_path(&root, root.join("a.txt")).expect("path valid");
    assert_eq!(validated, root.join("a.txt"));
}

#[test]
fn absolute_path_outside_root_is_rejected() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let other = tempfile::tempdir().expect("tempdir");
    let outside = other.path().canonicalize().expect("canonical").join("x.txt");

    let err = workspace_path(workspace.path(), &outside).expect_err("outside rejected");
    assert!(err.to_string().contains("outside the workspace"));
}

#[cfg(unix)]
#[test]
fn rejects_symlink_escape() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let other = tempfile::tempdir().expect("tempdir");
    std::fs::write(other.path().join("secret.txt"), b"secret").expect("write");
    std::os::unix::fs::symlink(other.path().join("secret.txt"), workspace.path().join("link"))
        .expect("symlink");

    let err = workspace_path(workspace.path(), Path::new("link")).expect_err("escape rejected");
    assert!(err.to_string().contains("symlink target escapes workspace"));
}

#[test]
fn missing_root_is_rejected() {
    let result = workspace_path(Path::new("/no/such/workspace/root"), Path::new("a"));
    assert!(matches!(result, Err(AppError::PathViolation(_))));
}

#[cfg(unix)]
#[test]
fn rejects_dangling_symlink_escape() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let other = tempfile::tempdir().expect("tempdir");
    std::os::unix::fs::symlink(other.path().join("not-yet.txt"), workspace.path().join("dangling"))
        .expect("symlink");

    let err = workspace_path(workspace.path(), Path::new("dangling")).expect_err("escape rejected");
    assert!(err.to_string().contains("symlink target escapes workspace"), "{err}");
}

#[cfg(unix)]
#[test]
fn dangling_symlink_inside_workspace_is_allowed() {
    let workspace = tempfile::tempdir().expect("tempdir");
    std::os::unix::fs::symlink("pending.txt", workspace.path().join("later")).expect("symlink");

    let validated = workspace_path(workspace.path(), Path::new("later")).expect("path valid");
    assert!(validated.ends_with("later"));
}

#[cfg(unix)]
#[test]
fn missing_file_under_escaping_directory_link_is_rejected() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let other = tempfile::tempdir().expect("tempdir");
    std::os::unix::fs::symlink(other.path(), workspace.path().join("elsewhere")).expect("symlink");

    let err = workspace_path(workspace.path(), Path::new("elsewhere/new.txt"))
        .expect_err("escape rejected");
    assert!(err.to_string().contains("symlink target escapes workspace"), "{err}");
}
