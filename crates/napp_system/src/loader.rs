//! Loading NApp descriptors from shared libraries.

use kyco_event_system::{NAppDescriptor, NAppDescriptorFn, NAppError, NAPP_DESCRIPTOR_SYMBOL};
use libloading::{Library, Symbol};
use std::path::Path;
use tracing::debug;

/// A descriptor together with the library its code lives in.
///
/// Field order matters: the descriptor must be dropped before the library.
pub struct LibraryEntry {
    pub descriptor: NAppDescriptor,
    pub library: Library,
}

/// Opens `path` and calls its exported descriptor function.
pub fn load_library(name: &str, path: &Path) -> Result<LibraryEntry, NAppError> {
    if !path.exists() {
        return Err(NAppError::EntryNotFound {
            name: name.to_string(),
            reason: format!("library {} does not exist", path.display()),
        });
    }

    debug!(napp = name, path = %path.display(), "Opening NApp library");

    let library = unsafe {
        Library::new(path).map_err(|e| NAppError::Library {
            name: name.to_string(),
            reason: format!("failed to load library: {}", e),
        })?
    };

    let descriptor_ptr = {
        let descriptor_fn: Symbol<NAppDescriptorFn> = unsafe {
            library.get(NAPP_DESCRIPTOR_SYMBOL).map_err(|e| NAppError::Library {
                name: name.to_string(),
                reason: format!("missing descriptor symbol: {}", e),
            })?
        };
        unsafe { descriptor_fn() }
    };

    if descriptor_ptr.is_null() {
        return Err(NAppError::Library {
            name: name.to_string(),
            reason: "descriptor function returned null".to_string(),
        });
    }

    let descriptor = unsafe { *Box::from_raw(descriptor_ptr) };
    Ok(LibraryEntry { descriptor, library })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let result = load_library("ghost", Path::new("/nonexistent/libghost.so"));
        assert!(matches!(result, Err(NAppError::EntryNotFound { .. })));
    }

    #[test]
    fn test_file_that_is_not_a_library() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("libfake.so");
        std::fs::write(&path, b"not an object file").expect("write fake library");

        assert!(matches!(load_library("fake", &path), Err(NAppError::Library { .. })));
    }
}
