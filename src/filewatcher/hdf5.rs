//! HDF5 frame lookup.
//!
//! The HDF5 library is reached through [`Hdf5Backend`]. A master file lists
//! where each frame lives (a data file and an offset into its dataset); a
//! frame is present once its chunk has a non-zero stored size. Files written
//! in single-writer-multiple-reader mode are read while the detector is still
//! writing, so a handful of errors are expected and transient.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Error messages raised while a writer is still producing the file
const TRANSIENT_MESSAGES: &[&str] = &[
    "truncated file",
    "not in swmr writing mode",
    "addr overflow",
    "address of object past end of allocation",
    "bad object header version number",
    "bad version number for object header prefix",
];

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct Hdf5Error {
    pub message: String,
}

impl Hdf5Error {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Known to clear up once the writer has made progress
    pub fn is_transient(&self) -> bool {
        let message = self.message.to_ascii_lowercase();
        TRANSIENT_MESSAGES.iter().any(|known| message.contains(known))
    }
}

/// Where one frame of a virtual dataset is stored
#[derive(Debug, Clone, PartialEq)]
pub struct FrameLocation {
    pub data_file: PathBuf,
    pub frame_offset: u64,
}

/// An open data file
pub trait Hdf5DataFile: Send + std::fmt::Debug {
    /// Re-read metadata written since the file was opened
    fn refresh(&mut self) -> Result<(), Hdf5Error>;

    /// Stored size of the chunk holding `frame_offset`; zero while unwritten
    fn chunk_size(&mut self, frame_offset: u64) -> Result<u64, Hdf5Error>;

    fn close(&mut self);
}

pub trait Hdf5Backend: Send + Sync + std::fmt::Debug {
    /// Frame layout of a master file, in image order
    fn open_master(&self, path: &Path) -> Result<Vec<FrameLocation>, Hdf5Error>;

    /// Open a data file in SWMR mode; `None` if it does not exist yet
    fn open_data(&self, path: &Path) -> Result<Option<Box<dyn Hdf5DataFile>>, Hdf5Error>;
}

/// Data files opened during one activation
///
/// Every handle is closed when this is dropped, whichever way the
/// activation ends.
#[derive(Debug)]
pub struct FileHandles<'a> {
    backend: &'a dyn Hdf5Backend,
    handles: HashMap<PathBuf, Box<dyn Hdf5DataFile>>,
}

impl<'a> FileHandles<'a> {
    pub fn new(backend: &'a dyn Hdf5Backend) -> Self {
        Self {
            backend,
            handles: HashMap::new(),
        }
    }

    pub fn backend(&self) -> &'a dyn Hdf5Backend {
        self.backend
    }

    /// Whether the frame's chunk has been written
    pub fn frame_written(&mut self, frame: &FrameLocation) -> Result<bool, Hdf5Error> {
        if !self.handles.contains_key(&frame.data_file) {
            match self.backend.open_data(&frame.data_file)? {
                Some(handle) => {
                    debug!(data_file = %frame.data_file.display(), "Opened HDF5 data file");
                    self.handles.insert(frame.data_file.clone(), handle);
                }
                None => return Ok(false),
            }
        }
        let Some(handle) = self.handles.get_mut(&frame.data_file) else {
            return Ok(false);
        };
        handle.refresh()?;
        Ok(handle.chunk_size(frame.frame_offset)? > 0)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for FileHandles<'_> {
    fn drop(&mut self) {
        for (path, mut handle) in self.handles.drain() {
            handle.close();
            debug!(data_file = %path.display(), "Closed HDF5 data file");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable backend for watcher tests

    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    pub struct FakeState {
        /// Frames per data file, in order
        pub layout: Vec<FrameLocation>,
        /// Number of frames written so far
        pub written: u64,
        pub master_error: Option<Hdf5Error>,
        pub chunk_error: Option<Hdf5Error>,
        pub opened: u32,
        pub closed: u32,
        pub refreshed: u32,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeHdf5 {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeHdf5 {
        /// `files` data files holding `per_file` frames each
        pub fn with_frames(files: u64, per_file: u64) -> Self {
            let fake = Self::default();
            fake.state.lock().layout = (0..files * per_file)
                .map(|n| FrameLocation {
                    data_file: PathBuf::from(format!("/data/x_{:06}.h5", n / per_file + 1)),
                    frame_offset: n % per_file,
                })
                .collect();
            fake
        }

        pub fn write_frames(&self, written: u64) {
            self.state.lock().written = written;
        }
    }

    #[derive(Debug)]
    struct FakeDataFile {
        path: PathBuf,
        state: Arc<Mutex<FakeState>>,
    }

    impl Hdf5DataFile for FakeDataFile {
        fn refresh(&mut self) -> Result<(), Hdf5Error> {
            self.state.lock().refreshed += 1;
            Ok(())
        }

        fn chunk_size(&mut self, frame_offset: u64) -> Result<u64, Hdf5Error> {
            let state = self.state.lock();
            if let Some(error) = &state.chunk_error {
                return Err(error.clone());
            }
            let index = state
                .layout
                .iter()
                .position(|f| f.data_file == self.path && f.frame_offset == frame_offset)
                .map_or(u64::MAX, |p| p as u64);
            Ok(if index < state.written { 4096 } else { 0 })
        }

        fn close(&mut self) {
            self.state.lock().closed += 1;
        }
    }

    impl Hdf5Backend for FakeHdf5 {
        fn open_master(&self, _path: &Path) -> Result<Vec<FrameLocation>, Hdf5Error> {
            let state = self.state.lock();
            match &state.master_error {
                Some(error) => Err(error.clone()),
                None => Ok(state.layout.clone()),
            }
        }

        fn open_data(&self, path: &Path) -> Result<Option<Box<dyn Hdf5DataFile>>, Hdf5Error> {
            self.state.lock().opened += 1;
            Ok(Some(Box::new(FakeDataFile {
                path: path.to_path_buf(),
                state: self.state.clone(),
            })))
        }
    }
}
