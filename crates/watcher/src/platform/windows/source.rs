//! `ReadDirectoryChangesW` change source
//!
//! Reads are overlapped with a completion routine. The routine only runs
//! while the worker sleeps alertably, so it can store its result in a plain
//! `Cell` reached through the otherwise unused `hEvent` field.

use super::records;
use super::worker::{ArmError, ChangeSource, Completion, Interrupt, Wake};
use sentinel_core::WatchError;
use std::cell::Cell;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use windows_sys::Win32::Foundation::{
    ERROR_INVALID_PARAMETER, ERROR_NOTIFY_ENUM_DIR, ERROR_OPERATION_ABORTED, ERROR_SUCCESS,
    GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_FAILED, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_ACCESS,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ReleaseSemaphore, SleepEx, WaitForSingleObjectEx, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};

const _: () = {
    use windows_sys::Win32::Storage::FileSystem as fs;
    assert!(records::FILE_ACTION_ADDED == fs::FILE_ACTION_ADDED);
    assert!(records::FILE_ACTION_REMOVED == fs::FILE_ACTION_REMOVED);
    assert!(records::FILE_ACTION_MODIFIED == fs::FILE_ACTION_MODIFIED);
    assert!(records::FILE_ACTION_RENAMED_OLD_NAME == fs::FILE_ACTION_RENAMED_OLD_NAME);
    assert!(records::FILE_ACTION_RENAMED_NEW_NAME == fs::FILE_ACTION_RENAMED_NEW_NAME);
};

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_LAST_ACCESS
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_SECURITY;

/// Error code and byte count of a finished read
type ResultSlot = Cell<Option<(u32, u32)>>;

/// Releases the worker's wake semaphore
pub struct SemaphoreInterrupt(Arc<OwnedHandle>);

impl Interrupt for SemaphoreInterrupt {
    fn interrupt(&self) {
        // SAFETY: the semaphore handle stays open while this Arc is alive.
        unsafe {
            ReleaseSemaphore(self.0.as_raw_handle() as HANDLE, 1, ptr::null_mut());
        }
    }
}

/// Directory handle opened for overlapped change reads
pub struct DirectoryChangeSource {
    directory: OwnedHandle,
    wake: Arc<OwnedHandle>,
    overlapped: Box<OVERLAPPED>,
    slot: Box<ResultSlot>,
    pending: bool,
}

// SAFETY: the raw pointers in `overlapped` point into `slot`, which is boxed
// and moves with the source. Reads are armed, waited on and cancelled by the
// one thread that owns the source.
unsafe impl Send for DirectoryChangeSource {}

impl ChangeSource for DirectoryChangeSource {
    type Interrupt = SemaphoreInterrupt;

    fn open(root: &Path) -> Result<Self, WatchError> {
        let metadata = std::fs::metadata(root).map_err(|e| WatchError::from_io(&e, root))?;
        if !metadata.is_dir() {
            return Err(WatchError::NotADirectory(root.to_path_buf()));
        }

        let wide: Vec<u16> = root.as_os_str().encode_wide().chain(Some(0)).collect();
        // SAFETY: `wide` is NUL-terminated and outlives the call.
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(WatchError::from_io(&io::Error::last_os_error(), root));
        }
        // SAFETY: the handle was just opened and is owned by nothing else.
        let directory = unsafe { OwnedHandle::from_raw_handle(handle as _) };

        // SAFETY: no pointer arguments besides the optional nulls.
        let semaphore = unsafe { CreateSemaphoreW(ptr::null(), 0, 1, ptr::null()) };
        if semaphore.is_null() {
            return Err(WatchError::io(
                "failed to create wake semaphore",
                &io::Error::last_os_error(),
            ));
        }
        // SAFETY: as above.
        let wake = Arc::new(unsafe { OwnedHandle::from_raw_handle(semaphore as _) });

        Ok(Self {
            directory,
            wake,
            // SAFETY: OVERLAPPED is plain data; all zeroes is its initial state.
            overlapped: Box::new(unsafe { std::mem::zeroed() }),
            slot: Box::new(Cell::new(None)),
            pending: false,
        })
    }

    fn interrupter(&self) -> SemaphoreInterrupt {
        SemaphoreInterrupt(self.wake.clone())
    }

    unsafe fn arm(&mut self, buffer: &mut [u8]) -> Result<(), ArmError> {
        let len = u32::try_from(buffer.len()).map_err(|_| ArmError::BufferTooLarge)?;
        // SAFETY: no read is pending, so the OS holds no reference to it.
        *self.overlapped = unsafe { std::mem::zeroed() };
        self.overlapped.hEvent = &*self.slot as *const ResultSlot as HANDLE;
        self.slot.set(None);

        // SAFETY: the buffer contract is upheld by the caller; `overlapped`
        // and `slot` are boxed and live until the read completes (see Drop).
        let ok = unsafe {
            ReadDirectoryChangesW(
                self.directory.as_raw_handle() as HANDLE,
                buffer.as_mut_ptr().cast(),
                len,
                1,
                NOTIFY_FILTER,
                ptr::null_mut(),
                &mut *self.overlapped,
                Some(on_complete),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32) {
                return Err(ArmError::BufferTooLarge);
            }
            return Err(err.into());
        }
        self.pending = true;
        Ok(())
    }

    fn wait(&mut self) -> Wake {
        loop {
            // SAFETY: the semaphore handle is open for the life of `self`.
            let status =
                unsafe { WaitForSingleObjectEx(self.wake.as_raw_handle() as HANDLE, INFINITE, 1) };

            if let Some((code, bytes)) = self.slot.take() {
                self.pending = false;
                return Wake::Completed(completion(code, bytes));
            }
            if status == WAIT_OBJECT_0 {
                return Wake::Interrupted;
            }
            if status == WAIT_FAILED {
                // SAFETY: reads thread-local state only.
                return Wake::Completed(Completion::Failed(unsafe { GetLastError() }));
            }
            // WAIT_IO_COMPLETION for some other APC: keep waiting
        }
    }
}

impl Drop for DirectoryChangeSource {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        // SAFETY: the directory handle is still open.
        unsafe {
            CancelIo(self.directory.as_raw_handle() as HANDLE);
        }
        // The cancelled read owns the buffer until its routine has run
        while self.slot.take().is_none() {
            // SAFETY: alertable sleep so the completion routine can run.
            unsafe {
                SleepEx(INFINITE, 1);
            }
        }
        self.pending = false;
    }
}

unsafe extern "system" fn on_complete(code: u32, bytes: u32, overlapped: *mut OVERLAPPED) {
    // SAFETY: `hEvent` was pointed at the source's slot in `arm`, and Drop
    // waits for this routine before freeing it.
    let slot = unsafe { &*((*overlapped).hEvent as *const ResultSlot) };
    slot.set(Some((code, bytes)));
}

fn completion(code: u32, bytes: u32) -> Completion {
    match code {
        ERROR_SUCCESS => Completion::Filled {
            bytes: bytes as usize,
        },
        ERROR_NOTIFY_ENUM_DIR => Completion::Overflow,
        ERROR_INVALID_PARAMETER => Completion::BufferTooLarge,
        ERROR_OPERATION_ABORTED => Completion::Aborted,
        other => Completion::Failed(other),
    }
}
