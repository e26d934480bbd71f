//! C ABI shared between the hotpack host and content package modules.
//!
//! Every loadable module exports exactly one discovery entry point named
//! [`EXPORTS_SYMBOL`] returning a pointer to a static [`RawModuleExports`]
//! table. The host reads the table once, right after mapping the library,
//! and copies everything it needs into owned Rust types.
//!
//! All strings are passed as pointer + length pairs ([`RawStr`]) and are
//! expected to be UTF-8. Every pointer in the table must stay valid for as
//! long as the library is mapped, which in practice means `'static` data.
//!
//! # Example
//!
//! ```rust,ignore
//! use hotpack_abi::{export_module, RawSlot, RawTypeEntry};
//!
//! unsafe extern "C" fn create_add() -> *mut std::ffi::c_void {
//!     Box::into_raw(Box::new(Add::default())) as *mut _
//! }
//!
//! export_module! {
//!     name: "Lib.Math",
//!     version: "1.2.0",
//!     types: [
//!         RawTypeEntry::new(
//!             "5f3c1c9e-52b4-4cb4-9d0d-6c0f5f0d7a11",
//!             "Add",
//!             "Lib.Math",
//!             &[RawSlot::new("9a1e…", "A", "f32"), RawSlot::new("0b7d…", "B", "f32")],
//!             &[RawSlot::new("c2f4…", "Result", "f32")],
//!             Some(create_add),
//!         ),
//!     ],
//!     dependencies: [("Lib.Core", "1.0.0")],
//!     native_imports: ["fastmath"],
//! }
//! ```

use std::ffi::c_void;

/// Current module ABI version.
/// Modules must export a table with this version to be loaded.
pub const ABI_VERSION: u32 = 1;

/// Name of the discovery entry point every module exports.
pub const EXPORTS_SYMBOL: &str = "hotpack_module_exports";

/// Creates one instance of an exported type and hands ownership to the caller.
pub type FactoryFn = unsafe extern "C" fn() -> *mut c_void;

/// Signature of the discovery entry point.
pub type ExportsFn = unsafe extern "C" fn() -> *const RawModuleExports;

/// Borrowed UTF-8 string (pointer + length).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl RawStr {
    pub const fn new(s: &'static str) -> Self {
        Self {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }

    pub const fn empty() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.len == 0
    }

    /// View the string.
    ///
    /// # Safety
    /// `ptr` must point to `len` readable bytes that outlive `'a`.
    pub unsafe fn as_str<'a>(&self) -> Result<&'a str, std::str::Utf8Error> {
        if self.is_empty() {
            return Ok("");
        }
        let bytes = std::slice::from_raw_parts(self.ptr, self.len);
        std::str::from_utf8(bytes)
    }
}

/// One input or output slot of an exported type.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSlot {
    /// Slot id (UUID, hyphenated)
    pub id: RawStr,
    pub name: RawStr,
    /// Value type name as understood by the graph collaborator
    pub value_type: RawStr,
}

impl RawSlot {
    pub const fn new(id: &'static str, name: &'static str, value_type: &'static str) -> Self {
        Self {
            id: RawStr::new(id),
            name: RawStr::new(name),
            value_type: RawStr::new(value_type),
        }
    }
}

/// One exported, instantiable type.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTypeEntry {
    /// Content id (UUID, hyphenated)
    pub content_id: RawStr,
    pub type_name: RawStr,
    pub namespace: RawStr,
    pub inputs: *const RawSlot,
    pub inputs_len: usize,
    pub outputs: *const RawSlot,
    pub outputs_len: usize,
    pub factory: Option<FactoryFn>,
}

impl RawTypeEntry {
    pub const fn new(
        content_id: &'static str,
        type_name: &'static str,
        namespace: &'static str,
        inputs: &'static [RawSlot],
        outputs: &'static [RawSlot],
        factory: Option<FactoryFn>,
    ) -> Self {
        Self {
            content_id: RawStr::new(content_id),
            type_name: RawStr::new(type_name),
            namespace: RawStr::new(namespace),
            inputs: inputs.as_ptr(),
            inputs_len: inputs.len(),
            outputs: outputs.as_ptr(),
            outputs_len: outputs.len(),
            factory,
        }
    }
}

/// A module-level dependency declared by the exporting module.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDependency {
    pub name: RawStr,
    /// Requested version, empty when any version will do
    pub version: RawStr,
}

impl RawDependency {
    pub const fn new(name: &'static str, version: &'static str) -> Self {
        Self {
            name: RawStr::new(name),
            version: RawStr::new(version),
        }
    }
}

/// Table returned by the discovery entry point.
#[repr(C)]
#[derive(Debug)]
pub struct RawModuleExports {
    /// ABI version - must match ABI_VERSION
    pub abi_version: u32,
    pub name: RawStr,
    pub version: RawStr,
    pub types: *const RawTypeEntry,
    pub types_len: usize,
    pub dependencies: *const RawDependency,
    pub dependencies_len: usize,
    /// Unmanaged library names the module expects the host to map for it
    pub native_imports: *const RawStr,
    pub native_imports_len: usize,
}

impl RawModuleExports {
    pub const fn new(
        name: &'static str,
        version: &'static str,
        types: &'static [RawTypeEntry],
        dependencies: &'static [RawDependency],
        native_imports: &'static [RawStr],
    ) -> Self {
        Self {
            abi_version: ABI_VERSION,
            name: RawStr::new(name),
            version: RawStr::new(version),
            types: types.as_ptr(),
            types_len: types.len(),
            dependencies: dependencies.as_ptr(),
            dependencies_len: dependencies.len(),
            native_imports: native_imports.as_ptr(),
            native_imports_len: native_imports.len(),
        }
    }
}

// The tables only ever point at immutable 'static data.
unsafe impl Sync for RawStr {}
unsafe impl Send for RawStr {}
unsafe impl Sync for RawSlot {}
unsafe impl Sync for RawTypeEntry {}
unsafe impl Sync for RawDependency {}
unsafe impl Sync for RawModuleExports {}

/// View a `(ptr, len)` pair as a slice, treating null as empty.
///
/// # Safety
/// When non-null, `ptr` must point to `len` initialized values outliving `'a`.
pub unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len)
    }
}

/// Export the discovery entry point for a module.
///
/// Generates a static [`RawModuleExports`] table and the `#[no_mangle]`
/// `hotpack_module_exports` function returning it. `dependencies` and
/// `native_imports` may be omitted.
#[macro_export]
macro_rules! export_module {
    (
        name: $name:expr,
        version: $version:expr,
        types: [ $( $ty:expr ),* $(,)? ] $(,)?
    ) => {
        $crate::export_module! {
            name: $name,
            version: $version,
            types: [ $( $ty ),* ],
            dependencies: [],
            native_imports: [],
        }
    };
    (
        name: $name:expr,
        version: $version:expr,
        types: [ $( $ty:expr ),* $(,)? ],
        dependencies: [ $( ($dep:expr, $dep_version:expr) ),* $(,)? ],
        native_imports: [ $( $native:expr ),* $(,)? ] $(,)?
    ) => {
        const __HOTPACK_TYPES: &[$crate::RawTypeEntry] = &[ $( $ty ),* ];
        const __HOTPACK_DEPENDENCIES: &[$crate::RawDependency] =
            &[ $( $crate::RawDependency::new($dep, $dep_version) ),* ];
        const __HOTPACK_NATIVE_IMPORTS: &[$crate::RawStr] =
            &[ $( $crate::RawStr::new($native) ),* ];

        static __HOTPACK_EXPORTS: $crate::RawModuleExports = $crate::RawModuleExports::new(
            $name,
            $version,
            __HOTPACK_TYPES,
            __HOTPACK_DEPENDENCIES,
            __HOTPACK_NATIVE_IMPORTS,
        );

        #[no_mangle]
        pub extern "C" fn hotpack_module_exports() -> *const $crate::RawModuleExports {
            &__HOTPACK_EXPORTS
        }
    };
}
