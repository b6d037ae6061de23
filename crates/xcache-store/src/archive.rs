//! Product archiving.
//!
//! Products are archived relative to the parent of the target's product
//! directory, so an archive of `.../Debug-iphonesimulator/Foo` holds paths
//! starting with `Foo/` and unpacks back into `.../Debug-iphonesimulator`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tar::{Archive, Builder};
use walkdir::WalkDir;

use crate::entry::ProductKind;
use crate::error::{StoreError, StoreResult};

/// What goes into a product archive, relative to the product dir's parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePlan {
    /// Archive root relative to the parent of the product directory
    pub root: PathBuf,
    /// Skip embedded `*.bundle` directories
    pub exclude_bundles: bool,
}

impl ProductKind {
    /// Check that the built product exists before anything is packaged.
    ///
    /// - static library: exactly one `*.a` directly inside `product_dir`
    /// - bundle / framework: `product_dir/<wrapper_name>` exists
    pub fn validate_product(
        &self,
        target: &str,
        product_dir: &Path,
        wrapper_name: Option<&str>,
    ) -> StoreResult<()> {
        match self {
            Self::StaticLibrary => {
                let libraries = match fs::read_dir(product_dir) {
                    Ok(entries) => entries
                        .filter_map(|e| e.ok())
                        .filter(|e| e.file_name().to_string_lossy().ends_with(".a"))
                        .count(),
                    Err(_) => 0,
                };
                if libraries != 1 {
                    return Err(StoreError::MissingProduct {
                        target: target.to_string(),
                        path: product_dir.join("*.a"),
                    });
                }
                Ok(())
            }
            Self::Framework | Self::Bundle => {
                let wrapper = wrapper_name.filter(|w| !w.is_empty()).ok_or_else(|| {
                    StoreError::MissingWrapperName {
                        target: target.to_string(),
                    }
                })?;
                let path = product_dir.join(wrapper);
                if !path.exists() {
                    return Err(StoreError::MissingProduct {
                        target: target.to_string(),
                        path,
                    });
                }
                Ok(())
            }
        }
    }

    /// Decide what to package for this kind of product.
    pub fn archive_plan(
        &self,
        target: &str,
        product_dir: &Path,
        wrapper_name: Option<&str>,
    ) -> StoreResult<ArchivePlan> {
        let dir_name = product_dir
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| StoreError::MissingProduct {
                target: target.to_string(),
                path: product_dir.to_path_buf(),
            })?;

        match self {
            Self::StaticLibrary => Ok(ArchivePlan {
                root: dir_name,
                exclude_bundles: true,
            }),
            Self::Bundle => {
                let wrapper = wrapper_name.filter(|w| !w.is_empty()).ok_or_else(|| {
                    StoreError::MissingWrapperName {
                        target: target.to_string(),
                    }
                })?;
                Ok(ArchivePlan {
                    root: dir_name.join(wrapper),
                    exclude_bundles: false,
                })
            }
            Self::Framework => Ok(ArchivePlan {
                root: dir_name,
                exclude_bundles: false,
            }),
        }
    }
}

/// Make module maps under `product_dir` refer to their siblings relatively.
///
/// Returns the number of rewritten files.
pub fn rewrite_module_maps(product_dir: &Path) -> StoreResult<usize> {
    if !product_dir.exists() {
        return Ok(0);
    }

    let mut rewritten = 0;
    for entry in WalkDir::new(product_dir).follow_links(false) {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().map_or(true, |ext| ext != "modulemap")
        {
            continue;
        }
        let Some(dir) = path.parent() else {
            continue;
        };

        let content = fs::read_to_string(path)?;
        let absolute_prefix = format!("{}/", dir.display());
        if content.contains(&absolute_prefix) {
            fs::write(path, content.replace(&absolute_prefix, ""))?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

/// Write the archive described by `plan` to `dest`.
///
/// `base` is the parent of the product directory. Entries are added in
/// sorted order; symlinks are stored as symlinks.
pub fn write_archive(base: &Path, plan: &ArchivePlan, dest: &Path) -> StoreResult<()> {
    let file = File::create(dest)?;
    let mut builder = Builder::new(file);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(base.join(&plan.root))
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|e| {
            !(plan.exclude_bundles
                && e.depth() > 0
                && e.file_name().to_string_lossy().ends_with(".bundle"))
        });

    for entry in walker {
        let entry = entry?;
        let rel_path = entry
            .path()
            .strip_prefix(base)
            .map_err(|_| StoreError::MissingProduct {
                target: plan.root.display().to_string(),
                path: entry.path().to_path_buf(),
            })?;
        builder.append_path_with_name(entry.path(), rel_path)?;
    }

    builder.into_inner()?.sync_all()?;
    Ok(())
}

/// Unpack `archive` into `dest`, creating `dest` if needed.
///
/// Existing files are overwritten, so re-running is harmless.
pub fn unpack_archive(archive: &Path, dest: &Path) -> StoreResult<()> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(File::open(archive)?);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_library(products: &Path) -> PathBuf {
        let product_dir = products.join("Foo");
        fs::create_dir_all(product_dir.join("Foo.bundle")).unwrap();
        fs::write(product_dir.join("libFoo.a"), b"!<arch>\nlib").unwrap();
        fs::write(product_dir.join("Foo.bundle/image.png"), b"png").unwrap();
        fs::create_dir_all(product_dir.join("include/Foo")).unwrap();
        fs::write(product_dir.join("include/Foo/Foo.h"), b"#import <UIKit/UIKit.h>").unwrap();
        product_dir
    }

    #[test]
    fn test_validate_static_library() {
        let temp_dir = TempDir::new().unwrap();
        let product_dir = make_library(temp_dir.path());
        assert!(ProductKind::StaticLibrary
            .validate_product("Foo", &product_dir, None)
            .is_ok());

        fs::write(product_dir.join("libOther.a"), b"x").unwrap();
        let err = ProductKind::StaticLibrary
            .validate_product("Foo", &product_dir, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingProduct { .. }));
    }

    #[test]
    fn test_validate_wrapper_products() {
        let temp_dir = TempDir::new().unwrap();
        let product_dir = temp_dir.path().join("Res");
        fs::create_dir_all(product_dir.join("Res.bundle")).unwrap();

        assert!(ProductKind::Bundle
            .validate_product("Res", &product_dir, Some("Res.bundle"))
            .is_ok());
        assert!(matches!(
            ProductKind::Bundle.validate_product("Res", &product_dir, None),
            Err(StoreError::MissingWrapperName { .. })
        ));
        assert!(matches!(
            ProductKind::Framework.validate_product("Res", &product_dir, Some("Res.framework")),
            Err(StoreError::MissingProduct { .. })
        ));
    }

    #[test]
    fn test_archive_plan_by_kind() {
        let product_dir = Path::new("/build/Debug-iphonesimulator/Foo");
        let lib = ProductKind::StaticLibrary.archive_plan("Foo", product_dir, None).unwrap();
        assert_eq!(lib.root, PathBuf::from("Foo"));
        assert!(lib.exclude_bundles);

        let bundle = ProductKind::Bundle
            .archive_plan("Foo", product_dir, Some("Foo.bundle"))
            .unwrap();
        assert_eq!(bundle.root, PathBuf::from("Foo/Foo.bundle"));

        let framework = ProductKind::Framework
            .archive_plan("Foo", product_dir, Some("Foo.framework"))
            .unwrap();
        assert_eq!(framework.root, PathBuf::from("Foo"));
        assert!(!framework.exclude_bundles);
    }

    #[test]
    fn test_library_archive_excludes_bundles() {
        let temp_dir = TempDir::new().unwrap();
        let products = temp_dir.path().join("Debug");
        let product_dir = make_library(&products);
        let archive = temp_dir.path().join("product.tar");

        let plan = ProductKind::StaticLibrary.archive_plan("Foo", &product_dir, None).unwrap();
        write_archive(&products, &plan, &archive).unwrap();

        let out = temp_dir.path().join("out");
        unpack_archive(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("Foo/libFoo.a")).unwrap(), b"!<arch>\nlib");
        assert!(out.join("Foo/include/Foo/Foo.h").exists());
        assert!(!out.join("Foo/Foo.bundle").exists());
    }

    #[test]
    fn test_rewrite_module_maps() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("Foo");
        fs::create_dir_all(&dir).unwrap();
        let map = dir.join("Foo.modulemap");
        fs::write(
            &map,
            format!("module Foo {{\n  umbrella header \"{}/Foo-umbrella.h\"\n}}\n", dir.display()),
        )
        .unwrap();
        fs::write(dir.join("other.modulemap"), "module Other {}\n").unwrap();

        assert_eq!(rewrite_module_maps(temp_dir.path()).unwrap(), 1);
        assert_eq!(
            fs::read_to_string(&map).unwrap(),
            "module Foo {\n  umbrella header \"Foo-umbrella.h\"\n}\n"
        );
    }

    #[test]
    fn test_unpack_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let products = temp_dir.path().join("Debug");
        let product_dir = make_library(&products);
        let archive = temp_dir.path().join("product.tar");
        let plan = ProductKind::Framework.archive_plan("Foo", &product_dir, Some("x")).unwrap();
        write_archive(&products, &plan, &archive).unwrap();

        let out = temp_dir.path().join("out");
        unpack_archive(&archive, &out).unwrap();
        unpack_archive(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("Foo/Foo.bundle/image.png")).unwrap(), b"png");
    }
}
