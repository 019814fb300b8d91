//! Registration of generated code with the host unwinder.

use crate::Error;
use gimli::UnwindSection;
use smallvec::SmallVec;

/// Makes `.eh_frame` data of generated code known to the host so stack walks
/// and crash handlers can cross JIT frames.
pub trait UnwindRegistry: Send + Sync {
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `unwind` is malformed or `code`
    /// is already registered.
    ///
    /// # Safety
    ///
    /// `unwind` must stay valid and unmoved until [`UnwindRegistry::unregister`]
    /// is called for `code`.
    unsafe fn register(&self, code: *const u8, code_size: usize, unwind: &[u8]) -> crate::Result<()>;

    /// # Safety
    ///
    /// `code` must have been passed to a successful [`UnwindRegistry::register`].
    unsafe fn unregister(&self, code: *const u8);

    /// Drops every registration at once, used when the code cache is cleared.
    fn unregister_all(&self);
}

/// An explicit opt-out for hosts that have no way to register JIT unwind info.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUnwindRegistry;

impl UnwindRegistry for NoUnwindRegistry {
    unsafe fn register(&self, code: *const u8, code_size: usize, unwind: &[u8]) -> crate::Result<()> {
        tracing::trace!(
            "not registering {:#x} bytes of unwind info for {code:p}+{code_size:#x}",
            unwind.len()
        );
        Ok(())
    }

    unsafe fn unregister(&self, _code: *const u8) {}

    fn unregister_all(&self) {}
}

/// Offsets of every frame description entry in an `.eh_frame` section.
///
/// # Errors
///
/// Rejects the section with [`Error::InvalidArgument`] if any entry fails to
/// parse.
pub fn frame_description_offsets(unwind: &[u8]) -> crate::Result<SmallVec<[usize; 4]>> {
    let eh_frame = gimli::EhFrame::new(unwind, gimli::NativeEndian);
    let bases = gimli::BaseAddresses::default().set_eh_frame(unwind.as_ptr() as u64);

    let mut offsets = SmallVec::new();
    let mut entries = eh_frame.entries(&bases);
    loop {
        let entry = entries.next().map_err(|err| {
            tracing::warn!("malformed unwind info: {err}");
            Error::InvalidArgument
        })?;
        match entry {
            None => break,
            Some(gimli::CieOrFde::Cie(_)) => {}
            Some(gimli::CieOrFde::Fde(partial)) => {
                let fde = partial
                    .parse(|section, bases, offset| section.cie_from_offset(bases, offset))
                    .map_err(|err| {
                        tracing::warn!("malformed frame description entry: {err}");
                        Error::InvalidArgument
                    })?;
                offsets.push(fde.offset());
            }
        }
    }

    Ok(offsets)
}

/// The addresses to hand to `__register_frame` for a section at `base`.
///
/// libgcc walks the whole section from its start up to the zero terminator,
/// libunwind takes one FDE per call.
pub fn registration_entries(
    base: usize,
    fde_offsets: &[usize],
    whole_section: bool,
) -> SmallVec<[usize; 4]> {
    if whole_section {
        SmallVec::from_slice(&[base])
    } else {
        fde_offsets.iter().map(|offset| base + offset).collect()
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(unix, not(miri)))] {
        mod native {
            use super::{frame_description_offsets, registration_entries, UnwindRegistry};
            use crate::Error;
            use hashbrown::HashMap;
            use smallvec::SmallVec;

            extern "C" {
                // libgcc_s on Linux, libunwind everywhere else.
                fn __register_frame(fde: *const u8);
                fn __deregister_frame(fde: *const u8);
            }

            /// libgcc takes the whole section, libunwind wants every FDE
            /// registered separately.
            const REGISTER_WHOLE_SECTION: bool =
                cfg!(any(all(target_os = "linux", target_env = "gnu"), target_os = "freebsd"));

            /// Registers unwind info with the host's `__register_frame`.
            #[derive(Debug, Default)]
            pub struct NativeUnwindRegistry {
                registrations: spin::Mutex<HashMap<usize, SmallVec<[usize; 4]>>>,
            }

            impl NativeUnwindRegistry {
                pub fn new() -> Self {
                    Self::default()
                }

                pub fn len(&self) -> usize {
                    self.registrations.lock().len()
                }

                pub fn is_empty(&self) -> bool {
                    self.len() == 0
                }

                fn deregister(entries: &[usize]) {
                    for entry in entries.iter().rev() {
                        // SAFETY: every entry was handed to `__register_frame` before.
                        unsafe { __deregister_frame(*entry as *const u8) };
                    }
                }
            }

            impl UnwindRegistry for NativeUnwindRegistry {
                unsafe fn register(
                    &self,
                    code: *const u8,
                    code_size: usize,
                    unwind: &[u8],
                ) -> crate::Result<()> {
                    let offsets = frame_description_offsets(unwind)?;
                    if offsets.is_empty() {
                        return Err(Error::InvalidArgument);
                    }

                    let entries =
                        registration_entries(unwind.as_ptr() as usize, &offsets, REGISTER_WHOLE_SECTION);

                    let mut registrations = self.registrations.lock();
                    if registrations.contains_key(&(code as usize)) {
                        return Err(Error::InvalidArgument);
                    }
                    for entry in &entries {
                        // SAFETY: validated above, the caller keeps `unwind` alive.
                        unsafe { __register_frame(*entry as *const u8) };
                    }
                    tracing::trace!(
                        "registered {} frame(s) for {code:p}+{code_size:#x}",
                        entries.len()
                    );
                    registrations.insert(code as usize, entries);
                    Ok(())
                }

                unsafe fn unregister(&self, code: *const u8) {
                    if let Some(entries) = self.registrations.lock().remove(&(code as usize)) {
                        Self::deregister(&entries);
                    }
                }

                fn unregister_all(&self) {
                    for (_, entries) in self.registrations.lock().drain() {
                        Self::deregister(&entries);
                    }
                }
            }

            impl Drop for NativeUnwindRegistry {
                fn drop(&mut self) {
                    self.unregister_all();
                }
            }
        }

        pub use native::NativeUnwindRegistry;

        /// The best registry available on this host.
        pub fn host_unwind_registry() -> alloc::boxed::Box<dyn UnwindRegistry> {
            alloc::boxed::Box::new(NativeUnwindRegistry::new())
        }
    } else {
        /// The best registry available on this host.
        pub fn host_unwind_registry() -> alloc::boxed::Box<dyn UnwindRegistry> {
            alloc::boxed::Box::new(NoUnwindRegistry)
        }
    }
}
