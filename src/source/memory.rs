//! In-process image store.
//!
//! [`ImageStore`] holds named ring buffers the way a shared-memory directory
//! does. Producers get an [`ImageWriter`], consumers an [`ImageReader`].
//! Readers keep their image alive after removal so they can observe that its
//! semaphore went invalid, exactly like a mapping that outlives the file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::watch;
use tracing::{debug, trace};

use super::{ImageSink, ImageSource, SinkHandle, SourceHandle, SourceStatus};
use crate::types::{FrameShape, Timestamp};
use crate::{RelayError, Result};

#[derive(Debug)]
struct ImageState {
    shape: FrameShape,
    ready: bool,
    valid: bool,
    frame_counter: u64,
    write_cursor: i64,
    timestamp: Timestamp,
    slots: Vec<Vec<u8>>,
}

impl ImageState {
    fn new(shape: FrameShape, ready: bool) -> Self {
        Self {
            shape,
            ready,
            valid: true,
            frame_counter: 0,
            write_cursor: -1,
            timestamp: Timestamp::default(),
            slots: vec![vec![0u8; shape.slice_len()]; shape.slots()],
        }
    }
}

#[derive(Debug)]
struct SharedImage {
    name: String,
    state: Mutex<ImageState>,
    /// Bumped on every reader notification.
    updates: watch::Sender<u64>,
}

impl SharedImage {
    fn state(&self) -> MutexGuard<'_, ImageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.updates.send_modify(|n| *n = n.wrapping_add(1));
    }
}

type Catalog = HashMap<String, Arc<SharedImage>>;

/// Named collection of in-process images.
///
/// Cloning the store yields another handle to the same images.
#[derive(Debug, Clone, Default)]
pub struct ImageStore {
    images: Arc<RwLock<Catalog>>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ready image, replacing any image of the same name.
    pub fn create(&self, name: &str, shape: FrameShape) -> ImageWriter {
        self.insert(name, shape, true)
    }

    /// Create an image whose producer has not finished initializing it.
    ///
    /// Opening it fails with `SourceNotReady` until
    /// [`ImageWriter::mark_ready`] is called.
    pub fn create_not_ready(&self, name: &str, shape: FrameShape) -> ImageWriter {
        self.insert(name, shape, false)
    }

    fn insert(&self, name: &str, shape: FrameShape, ready: bool) -> ImageWriter {
        let (updates, _) = watch::channel(0);
        let image = Arc::new(SharedImage {
            name: name.to_string(),
            state: Mutex::new(ImageState::new(shape, ready)),
            updates,
        });

        let previous = self.catalog_mut().insert(name.to_string(), Arc::clone(&image));
        if let Some(previous) = previous {
            previous.state().valid = false;
            previous.notify();
        }
        debug!(image = name, %shape, ready, "Image created");

        ImageWriter { image, store: self.clone() }
    }

    /// Open an image for reading.
    pub fn open(&self, name: &str) -> Result<ImageReader> {
        let image = self.catalog().get(name).cloned();
        let image = image.ok_or_else(|| RelayError::source_not_found(name))?;
        if !image.state().ready {
            return Err(RelayError::source_not_ready(name));
        }
        Ok(ImageReader { image })
    }

    /// Names of all images, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.catalog().contains_key(name)
    }

    fn catalog(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.images.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn catalog_mut(&self) -> std::sync::RwLockWriteGuard<'_, Catalog> {
        self.images.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove `image` from the catalog if it is still the registered one.
    fn remove(&self, image: &Arc<SharedImage>) {
        let mut catalog = self.catalog_mut();
        if catalog.get(&image.name).is_some_and(|current| Arc::ptr_eq(current, image)) {
            catalog.remove(&image.name);
        }
    }
}

impl ImageSource for ImageStore {
    type Handle = ImageReader;

    fn open(&self, name: &str) -> Result<ImageReader> {
        ImageStore::open(self, name)
    }

    fn list(&self) -> Vec<String> {
        self.names()
    }
}

impl ImageSink for ImageStore {
    type Handle = ImageWriter;

    fn create(&self, name: &str, shape: FrameShape) -> Result<ImageWriter> {
        Ok(ImageStore::create(self, name, shape))
    }
}

/// Producer handle. Dropping it removes the image.
#[derive(Debug)]
pub struct ImageWriter {
    image: Arc<SharedImage>,
    store: ImageStore,
}

impl ImageWriter {
    pub fn name(&self) -> &str {
        &self.image.name
    }

    pub fn mark_ready(&self) {
        self.image.state().ready = true;
    }

    /// Write the next frame into the following ring slot, stamping it with
    /// the current time.
    ///
    /// Returns the new frame counter.
    pub fn write(&self, data: &[u8]) -> Result<u64> {
        self.write_at(data, Timestamp::now())
    }

    /// Like [`ImageWriter::write`] with an explicit timestamp.
    pub fn write_at(&self, data: &[u8], timestamp: Timestamp) -> Result<u64> {
        let counter = {
            let mut state = self.image.state();
            check_len(&self.image.name, state.shape, data.len())?;
            let slot = if state.shape.is_cube() {
                ((state.write_cursor + 1) as usize) % state.shape.slots()
            } else {
                0
            };
            state.slots[slot].copy_from_slice(data);
            state.write_cursor = slot as i64;
            state.frame_counter += 1;
            state.timestamp = timestamp;
            state.frame_counter
        };
        trace!(image = %self.image.name, counter, "Frame written");
        self.image.notify();
        Ok(counter)
    }

    /// Change the image geometry. Slot contents are reset, the frame counter
    /// keeps counting.
    pub fn reshape(&self, shape: FrameShape) {
        {
            let mut state = self.image.state();
            state.shape = shape;
            state.slots = vec![vec![0u8; shape.slice_len()]; shape.slots()];
            state.write_cursor = -1;
        }
        debug!(image = %self.image.name, %shape, "Image reshaped");
        self.image.notify();
    }

    /// Simulate a producer crash: the semaphore goes invalid and the image
    /// disappears from the catalog.
    pub fn invalidate(&self) {
        self.image.state().valid = false;
        self.store.remove(&self.image);
        self.image.notify();
        debug!(image = %self.image.name, "Image invalidated");
    }

    /// Reader view of this image.
    pub fn reader(&self) -> ImageReader {
        ImageReader { image: Arc::clone(&self.image) }
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        self.image.state().valid = false;
        self.store.remove(&self.image);
        self.image.notify();
    }
}

impl SinkHandle for ImageWriter {
    fn shape(&self) -> FrameShape {
        self.image.state().shape
    }

    fn write_slice(
        &mut self,
        data: &[u8],
        frame_counter: u64,
        timestamp: Timestamp,
    ) -> Result<()> {
        let mut state = self.image.state();
        check_len(&self.image.name, state.shape, data.len())?;
        state.slots[0].copy_from_slice(data);
        state.write_cursor = 0;
        state.frame_counter = frame_counter;
        state.timestamp = timestamp;
        Ok(())
    }

    fn notify_readers(&self) {
        self.image.notify();
    }
}

/// Consumer handle.
#[derive(Debug, Clone)]
pub struct ImageReader {
    image: Arc<SharedImage>,
}

impl ImageReader {
    /// Receiver that changes on every reader notification.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.image.updates.subscribe()
    }

    /// Copy of the newest slice.
    pub fn latest(&self) -> Vec<u8> {
        let state = self.image.state();
        let status = status_of(&state);
        state.slots[status.current_slot()].clone()
    }
}

impl SourceHandle for ImageReader {
    fn name(&self) -> &str {
        &self.image.name
    }

    fn status(&self) -> SourceStatus {
        status_of(&self.image.state())
    }

    fn read_slice(&self, slot: usize, out: &mut [u8]) -> Result<()> {
        let state = self.image.state();
        if !state.valid {
            return Err(RelayError::source_lost(self.image.name.clone(), "semaphore invalid"));
        }
        let Some(data) = state.slots.get(slot) else {
            return Err(RelayError::ShapeChanged { name: self.image.name.clone() });
        };
        if data.len() != out.len() {
            return Err(RelayError::ShapeChanged { name: self.image.name.clone() });
        }
        out.copy_from_slice(data);
        Ok(())
    }
}

fn status_of(state: &ImageState) -> SourceStatus {
    SourceStatus {
        shape: state.shape,
        frame_counter: state.frame_counter,
        write_cursor: state.write_cursor,
        timestamp: state.timestamp,
        semaphore_valid: state.valid,
    }
}

fn check_len(name: &str, shape: FrameShape, len: usize) -> Result<()> {
    if len != shape.slice_len() {
        return Err(RelayError::ShapeChanged { name: name.to_string() });
    }
    Ok(())
}
