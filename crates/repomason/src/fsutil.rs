//! Small filesystem helpers shared by the build pipelines.

use std::fs;
use std::io;
use std::path::Path;

/// Hardlink `src` to `dst`, falling back to a copy when linking fails
/// (cross-device, or a filesystem without hardlinks).
pub fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.exists() {
        fs::remove_file(dst)?;
    }
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => fs::copy(src, dst).map(|_| ()),
    }
}

/// Recursively copy a directory tree. Symlinks are followed.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Move every regular file at the top of `src` into `dst`.
pub fn move_files(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            let target = dst.join(entry.file_name());
            if fs::rename(entry.path(), &target).is_err() {
                fs::copy(entry.path(), &target)?;
                fs::remove_file(entry.path())?;
            }
        }
    }
    Ok(())
}

/// Files directly under `dir` whose name ends with `suffix`, sorted.
pub fn files_with_suffix(dir: &Path, suffix: &str) -> io::Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file()
            && entry.file_name().to_string_lossy().ends_with(suffix)
        {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_preserves_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("debian/source")).unwrap();
        fs::write(src.join("debian/control"), "Source: x\n").unwrap();
        fs::write(src.join("debian/source/format"), "3.0 (quilt)\n").unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(
            fs::read_to_string(dst.join("debian/source/format")).unwrap(),
            "3.0 (quilt)\n"
        );
    }

    #[test]
    fn move_files_takes_only_top_level_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("pkg");
        fs::create_dir_all(src.join("tree")).unwrap();
        fs::write(src.join("a.deb"), "x").unwrap();
        fs::write(src.join("tree/inner.deb"), "x").unwrap();

        let dst = dir.path().join("output");
        move_files(&src, &dst).unwrap();
        assert!(dst.join("a.deb").exists());
        assert!(!dst.join("inner.deb").exists());
        assert!(!src.join("a.deb").exists());
        assert!(src.join("tree/inner.deb").exists());
    }

    #[test]
    fn files_with_suffix_filters_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("b.rpm"), "x").unwrap();
        fs::write(dir.path().join("a.rpm"), "x").unwrap();
        fs::write(dir.path().join("c.deb"), "x").unwrap();

        let rpms = files_with_suffix(dir.path(), ".rpm").unwrap();
        let names: Vec<_> = rpms
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.rpm", "b.rpm"]);
    }

    #[test]
    fn link_or_copy_overwrites_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, "new").unwrap();
        fs::write(&dst, "old").unwrap();
        link_or_copy(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
    }
}
