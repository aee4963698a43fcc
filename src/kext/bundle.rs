//! On-disk kext bundle layout and executable inspection.
//!
//! ```text
//! Foo.kext/
//!   Contents/
//!     Info.plist
//!     MacOS/<CFBundleExecutable>
//!     PlugIns/Bar.kext/...
//! ```

use crate::plist::{self, Dictionary, Value};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub const KEXT_EXTENSION: &str = "kext";
const CONTENTS_DIR: &str = "Contents";
pub const INFO_PLIST: &str = "Info.plist";
const EXECUTABLE_DIR: &str = "MacOS";
const PLUGINS_DIR: &str = "PlugIns";

/// Paths inside a kext bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BundleLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contents_dir(&self) -> PathBuf {
        self.root.join(CONTENTS_DIR)
    }

    pub fn info_plist(&self) -> PathBuf {
        self.contents_dir().join(INFO_PLIST)
    }

    pub fn executable_dir(&self) -> PathBuf {
        self.contents_dir().join(EXECUTABLE_DIR)
    }

    pub fn executable(&self, name: &str) -> PathBuf {
        self.executable_dir().join(name)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.contents_dir().join(PLUGINS_DIR)
    }

    /// Read the info dictionary.
    ///
    /// `Ok(None)` means the file is absent, undecodable, or not a dictionary:
    /// a validation problem, not an IO failure.
    pub fn read_info_dictionary(&self) -> io::Result<Option<Dictionary>> {
        match plist::read_from_path(&self.info_plist()) {
            Ok(Some(Value::Dictionary(dict))) => Ok(Some(dict)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Whether `path` names a kext bundle by extension.
pub fn has_kext_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == KEXT_EXTENSION)
        .unwrap_or(false)
}

/// Name and version embedded in a kext executable's kmod_info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmodInfo {
    pub name: String,
    pub version: String,
}

/// Result of looking for kmod_info in an executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmodLookup {
    Found(KmodInfo),
    Missing,
    /// The inspector cannot read symbol tables.
    Unavailable,
}

/// Reads headers of kext executables.
pub trait ExecutableInspector {
    /// Whether the executable contains code for the host architecture.
    fn supports_host_arch(&self, executable: &Path) -> io::Result<bool>;

    /// Locate the kmod_info record of the executable.
    fn kmod_info(&self, executable: &Path) -> io::Result<KmodLookup>;
}

const MH_MAGIC: u32 = 0xfeed_face;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_CIGAM: u32 = 0xbeba_feca;

const CPU_ARCH_ABI64: i32 = 0x0100_0000;
const CPU_TYPE_X86: i32 = 7;
const CPU_TYPE_ARM: i32 = 12;
const CPU_TYPE_POWERPC: i32 = 18;

/// Mach-O cpu type of the host, if it has one.
pub fn host_cpu_type() -> Option<i32> {
    if cfg!(target_arch = "x86_64") {
        Some(CPU_TYPE_X86 | CPU_ARCH_ABI64)
    } else if cfg!(target_arch = "x86") {
        Some(CPU_TYPE_X86)
    } else if cfg!(target_arch = "aarch64") {
        Some(CPU_TYPE_ARM | CPU_ARCH_ABI64)
    } else if cfg!(target_arch = "arm") {
        Some(CPU_TYPE_ARM)
    } else if cfg!(target_arch = "powerpc") {
        Some(CPU_TYPE_POWERPC)
    } else {
        None
    }
}

/// Default inspector: reads Mach-O and fat headers for architecture
/// support. It does not parse symbol tables, so kmod_info is reported as
/// unavailable.
#[derive(Debug, Clone)]
pub struct MachHeaderInspector {
    cpu_type: Option<i32>,
}

impl Default for MachHeaderInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl MachHeaderInspector {
    pub fn new() -> Self {
        MachHeaderInspector {
            cpu_type: host_cpu_type(),
        }
    }

    /// Inspector matching a specific Mach-O cpu type instead of the host's.
    pub fn for_cpu_type(cpu_type: i32) -> Self {
        MachHeaderInspector {
            cpu_type: Some(cpu_type),
        }
    }

    fn cpu_types(header: &[u8]) -> Vec<i32> {
        if header.len() < 8 {
            return Vec::new();
        }
        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let word = |offset: usize, big_endian: bool| -> Option<u32> {
            let bytes: [u8; 4] = header.get(offset..offset + 4)?.try_into().ok()?;
            Some(if big_endian {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            })
        };
        match magic {
            MH_MAGIC | MH_MAGIC_64 => word(4, true).map(|t| vec![t as i32]).unwrap_or_default(),
            MH_CIGAM | MH_CIGAM_64 => word(4, false).map(|t| vec![t as i32]).unwrap_or_default(),
            FAT_MAGIC | FAT_CIGAM => {
                let big_endian = magic == FAT_MAGIC;
                let count = word(4, big_endian).unwrap_or(0) as usize;
                // fat_arch records are 20 bytes following the 8-byte fat_header
                (0..count)
                    .filter_map(|index| word(8 + index * 20, big_endian))
                    .map(|t| t as i32)
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

impl ExecutableInspector for MachHeaderInspector {
    fn supports_host_arch(&self, executable: &Path) -> io::Result<bool> {
        let cpu_type = match self.cpu_type {
            Some(cpu_type) => cpu_type,
            None => return Ok(false),
        };
        let mut header = Vec::with_capacity(4096);
        File::open(executable)?.take(4096).read_to_end(&mut header)?;
        Ok(Self::cpu_types(&header).contains(&cpu_type))
    }

    fn kmod_info(&self, executable: &Path) -> io::Result<KmodLookup> {
        if !executable.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("executable not found: {}", executable.display()),
            ));
        }
        Ok(KmodLookup::Unavailable)
    }
}
