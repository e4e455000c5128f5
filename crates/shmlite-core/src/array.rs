//! Fixed-length typed arrays in shared memory
//!
//! Layout: an 8-byte element count in host byte order, followed by `count`
//! elements of `T` in their native representation. Every process sharing an
//! array has to agree on `T`'s exact layout.

use crate::flags::{AccessMode, OpenFlags};
use crate::name::Named;
use crate::shm::SharedSegment;
use crate::{Error, Result};
use bytemuck::Pod;
use log::{debug, error};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;

/// Width of the count header
pub const HEADER_LEN: usize = size_of::<u64>();

/// Write `count` copies of `value` at `dst`; byte-sized types take a single memset
///
/// # Safety
/// `dst` must be valid for `count * size_of::<T>()` bytes of writes.
unsafe fn fill_elements<T: Pod>(dst: *mut u8, count: usize, value: &T) {
    let src = bytemuck::bytes_of(value);
    match src.len() {
        0 => {}
        1 => ptr::write_bytes(dst, src[0], count),
        n => {
            for i in 0..count {
                ptr::copy_nonoverlapping(src.as_ptr(), dst.add(i * n), n);
            }
        }
    }
}

/// Fixed-length array of `T` over a shared segment
///
/// Index and validity are checked on every access, since another holder of
/// the segment may release it at any time.
#[derive(Debug)]
pub struct SharedArray<T> {
    count: usize,
    segment: Arc<SharedSegment>,
    _marker: PhantomData<T>,
}

impl<T: Pod> SharedArray<T> {
    /// Segment size needed for `count` elements
    pub fn calc_size(count: usize) -> Option<usize> {
        count
            .checked_mul(size_of::<T>())
            .and_then(|n| n.checked_add(HEADER_LEN))
    }

    /// Create or open an array of `count` elements.
    ///
    /// Existing contents are kept. Opening an existing name with another
    /// count rewrites the header and reinterprets the region. On failure the
    /// array is invalid and has length 0.
    pub fn create(name: &str, count: usize) -> Self {
        let Some(size) = Self::calc_size(count) else {
            error!("shared array '{}' of {} elements overflows", name, count);
            return Self::invalid(SharedSegment::unmapped(name, 0));
        };

        let segment = SharedSegment::open(name, size, OpenFlags::CREATE_READ_WRITE, false);
        let header = (count as u64).to_ne_bytes();
        match segment.write(|bytes| bytes[..HEADER_LEN].copy_from_slice(&header)) {
            Ok(()) => {
                debug!("shared array '{}' size = {}, count = {}", name, size, count);
                Self {
                    count,
                    segment: Arc::new(segment),
                    _marker: PhantomData,
                }
            }
            Err(e) => {
                error!("cannot allocate shared array '{}' of {} elements: {}", name, count, e);
                Self::invalid(segment)
            }
        }
    }

    /// Create or open an array and set every element to `value`
    pub fn create_filled(name: &str, count: usize, value: T) -> Self {
        let array = Self::create(name, count);
        if array.is_valid() {
            if let Err(e) = array.fill(value) {
                error!("cannot fill shared array '{}': {}", name, e);
            }
        }
        array
    }

    /// Open an existing array, taking the count from its header
    pub fn attach(name: &str) -> Result<Self> {
        let segment = SharedSegment::attach(name, AccessMode::ReadWrite)?;
        let available = segment.size();
        if available < HEADER_LEN {
            return Err(Error::InsufficientSpace {
                required: HEADER_LEN,
                available,
            });
        }

        let count = segment.read(|bytes| {
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&bytes[..HEADER_LEN]);
            u64::from_ne_bytes(header) as usize
        })?;
        let required = Self::calc_size(count).unwrap_or(usize::MAX);
        if required > available {
            return Err(Error::InsufficientSpace {
                required,
                available,
            });
        }

        Ok(Self {
            count,
            segment: Arc::new(segment),
            _marker: PhantomData,
        })
    }

    fn invalid(segment: SharedSegment) -> Self {
        Self {
            count: 0,
            segment: Arc::new(segment),
            _marker: PhantomData,
        }
    }

    /// Byte offset of element `index`
    fn offset(&self, index: usize) -> Result<usize> {
        if index >= self.count {
            return Err(Error::OutOfRange {
                index,
                size: self.count,
            });
        }
        Ok(HEADER_LEN + index * size_of::<T>())
    }

    fn data_end(&self) -> usize {
        HEADER_LEN + self.count * size_of::<T>()
    }

    /// Get a copy of element `index`
    pub fn get(&self, index: usize) -> Result<T> {
        let start = self.offset(index)?;
        self.segment
            .with_base(|base| unsafe { ptr::read_unaligned(base.add(start).cast::<T>()) })
    }

    /// Set element `index` to `value`
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        let start = self.offset(index)?;
        self.segment.with_base_mut(|base| unsafe {
            ptr::write_unaligned(base.add(start).cast::<T>(), value)
        })
    }

    /// Load element `index`, apply `f`, store it back.
    ///
    /// Not atomic: a concurrent writer between the load and the store is
    /// lost. `f` may freely access this array. Pair with a
    /// [`NamedSemaphore`](crate::NamedSemaphore) for exclusive updates.
    pub fn update<R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut value = self.get(index)?;
        let r = f(&mut value);
        self.set(index, value)?;
        Ok(r)
    }

    /// Set every element to `value`
    pub fn fill(&self, value: T) -> Result<()> {
        let count = self.count;
        self.segment
            .with_base_mut(|base| unsafe { fill_elements(base.add(HEADER_LEN), count, &value) })
    }

    /// Copy all elements out
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let end = self.data_end();
        self.segment.read(|bytes| {
            let data = &bytes[HEADER_LEN..end];
            match size_of::<T>() {
                0 => vec![<T as bytemuck::Zeroable>::zeroed(); self.count],
                n => data.chunks_exact(n).map(bytemuck::pod_read_unaligned).collect(),
            }
        })
    }

    /// Overwrite every element from `src`, which must hold exactly `len()` items
    pub fn copy_from_slice(&self, src: &[T]) -> Result<()> {
        if src.len() != self.count {
            return Err(Error::OutOfRange {
                index: src.len(),
                size: self.count,
            });
        }
        let len = std::mem::size_of_val(src);
        self.segment.with_base_mut(|base| unsafe {
            ptr::copy_nonoverlapping(src.as_ptr().cast::<u8>(), base.add(HEADER_LEN), len)
        })
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if the array holds no elements
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check if the backing segment is still mapped
    pub fn is_valid(&self) -> bool {
        self.segment.is_valid()
    }

    /// Backing segment, shared with any other holder
    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }
}

impl<T> Named for SharedArray<T> {
    fn name(&self) -> &str {
        self.segment.name()
    }

    fn describe(&self) -> String {
        format!(
            "shared array '{}' ({} x {} bytes)",
            self.segment.name(),
            self.count,
            size_of::<T>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::unique_name;
    use bytemuck::{Pod, Zeroable};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Foo {
        a: i32,
        b: u8,
        _pad: [u8; 3],
        c: f64,
    }

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C, packed)]
    struct Bar {
        a: i32,
        b: u8,
        c: f64,
    }

    fn cleanup(name: &str) {
        assert!(SharedSegment::unlink(name));
    }

    #[test]
    fn test_layout_sizes() {
        let names: Vec<_> = (0..4).map(|i| unique_name(&format!("arr{}", i))).collect();
        let arr1 = SharedArray::<u8>::create(&names[0], 10);
        let arr2 = SharedArray::<i32>::create(&names[1], 16);
        let arr3 = SharedArray::<Foo>::create(&names[2], 5);
        let arr4 = SharedArray::<Bar>::create(&names[3], 5);
        assert_eq!(arr1.segment().size(), 18);
        assert_eq!(arr2.segment().size(), 72);
        assert_eq!(arr3.segment().size(), 88);
        assert_eq!(arr4.segment().size(), 73);

        let header = arr2
            .segment()
            .read(|b| u64::from_ne_bytes(b[..HEADER_LEN].try_into().unwrap()))
            .unwrap();
        assert_eq!(header, 16);

        drop((arr1, arr2, arr3, arr4));
        names.iter().for_each(|n| cleanup(n));
    }

    #[test]
    fn test_create_filled_and_bounds() {
        let name = unique_name("fill_char");
        let arr = SharedArray::<u8>::create_filled(&name, 10, b'z');
        assert_eq!(arr.len(), 10);
        for i in 0..10 {
            assert_eq!(arr.get(i).unwrap(), b'z');
        }
        assert!(matches!(
            arr.get(10),
            Err(Error::OutOfRange { index: 10, size: 10 })
        ));
        assert!(matches!(arr.set(11, b'a'), Err(Error::OutOfRange { .. })));
        drop(arr);
        cleanup(&name);
    }

    #[test]
    fn test_set_then_fill() {
        let name = unique_name("brackets");
        let arr = SharedArray::<u8>::create(&name, 10);
        arr.set(0, b'a').unwrap();
        assert_eq!(arr.get(0).unwrap(), b'a');
        for i in 0..10 {
            arr.set(i, b'a' + i as u8).unwrap();
        }
        assert_eq!(arr.get(9).unwrap(), b'j');
        arr.fill(b'z').unwrap();
        assert_eq!(arr.to_vec().unwrap(), vec![b'z'; 10]);
        drop(arr);
        cleanup(&name);
    }

    #[test]
    fn test_struct_elements() {
        let name = unique_name("structs");
        let arr = SharedArray::<Foo>::create(&name, 5);
        let f1 = Foo {
            a: 0x12345678,
            b: b'c',
            _pad: [0; 3],
            c: 3.14159,
        };
        arr.set(0, f1).unwrap();
        let got = arr.get(0).unwrap();
        assert_eq!(got.a, 0x12345678);
        assert_eq!(got.b, b'c');
        assert_eq!(got.c, 3.14159);

        arr.fill(f1).unwrap();
        assert!(arr.to_vec().unwrap().iter().all(|f| *f == f1));
        drop(arr);
        cleanup(&name);
    }

    #[test]
    fn test_packed_elements() {
        let name = unique_name("packed");
        let arr = SharedArray::<Bar>::create_filled(&name, 3, Bar { a: 7, b: 1, c: 2.5 });
        let bar = arr.get(2).unwrap();
        let (a, c) = (bar.a, bar.c);
        assert_eq!(a, 7);
        assert_eq!(c, 2.5);
        drop(arr);
        cleanup(&name);
    }

    #[test]
    fn test_update() {
        let name = unique_name("update");
        let arr = SharedArray::<u64>::create_filled(&name, 4, 1);
        let old = arr
            .update(2, |v| {
                *v += 41;
                *v - 41
            })
            .unwrap();
        assert_eq!(old, 1);
        assert_eq!(arr.to_vec().unwrap(), vec![1, 1, 42, 1]);
        drop(arr);
        cleanup(&name);
    }

    #[test]
    fn test_update_reads_same_array() {
        let name = unique_name("update_nested");
        let arr = Arc::new(SharedArray::<u32>::create_filled(&name, 4, 1));
        let (tx, rx) = mpsc::channel();
        {
            let arr = Arc::clone(&arr);
            thread::spawn(move || {
                let r = arr.update(0, |v| *v = arr.get(1).unwrap() + 1);
                tx.send(r.is_ok()).unwrap();
            });
        }
        assert!(rx
            .recv_timeout(Duration::from_secs(3))
            .expect("update with nested get did not return"));
        assert_eq!(arr.to_vec().unwrap(), vec![2, 1, 1, 1]);

        let r = arr.update(3, |v| {
            arr.set(2, 7).unwrap();
            *v = arr.get(2).unwrap() * 2;
        });
        assert!(r.is_ok());
        assert_eq!(arr.to_vec().unwrap(), vec![2, 1, 7, 14]);
        drop(arr);
        cleanup(&name);
    }

    #[test]
    fn test_copy_from_slice() {
        let name = unique_name("copy");
        let arr = SharedArray::<i16>::create(&name, 3);
        arr.copy_from_slice(&[-1, 0, 1]).unwrap();
        assert_eq!(arr.to_vec().unwrap(), vec![-1, 0, 1]);
        assert!(matches!(
            arr.copy_from_slice(&[1, 2]),
            Err(Error::OutOfRange { index: 2, size: 3 })
        ));
        drop(arr);
        cleanup(&name);
    }

    #[test]
    fn test_recreate_with_other_count() {
        let name = unique_name("relayout");
        {
            let arr = SharedArray::<u8>::create_filled(&name, 10, b'w');
            assert_eq!(arr.get(9).unwrap(), b'w');
        }
        let arr = SharedArray::<u8>::create_filled(&name, 5, b'z');
        assert_eq!(arr.len(), 5);

        let attached = SharedArray::<u8>::attach(&name).unwrap();
        assert_eq!(attached.len(), 5);
        assert_eq!(attached.segment().size(), 18);
        assert_eq!(attached.to_vec().unwrap(), vec![b'z'; 5]);
        drop((arr, attached));
        cleanup(&name);
    }

    #[test]
    fn test_attach_sees_writes() {
        let name = unique_name("attach");
        let writer = SharedArray::<u32>::create_filled(&name, 8, 0);
        let reader = SharedArray::<u32>::attach(&name).unwrap();
        writer.set(3, 99).unwrap();
        assert_eq!(reader.get(3).unwrap(), 99);
        drop((writer, reader));
        cleanup(&name);
    }

    #[test]
    fn test_attach_too_small() {
        let name = unique_name("attach_small");
        let seg = SharedSegment::open(&name, 4, OpenFlags::CREATE_READ_WRITE, true);
        assert!(matches!(
            SharedArray::<u8>::attach(&name),
            Err(Error::InsufficientSpace { required: HEADER_LEN, available: 4 })
        ));
        drop(seg);

        let seg = SharedSegment::open(&name, HEADER_LEN, OpenFlags::CREATE_READ_WRITE, true);
        seg.write(|b| b.copy_from_slice(&100u64.to_ne_bytes())).unwrap();
        assert!(matches!(
            SharedArray::<u8>::attach(&name),
            Err(Error::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn test_released_segment_is_invalid() {
        let name = unique_name("released");
        let arr = SharedArray::<u8>::create_filled(&name, 4, 1);
        let shared = Arc::clone(arr.segment());
        shared.release().unwrap();

        assert!(!arr.is_valid());
        assert!(matches!(arr.get(0), Err(Error::InvalidResource(_))));
        assert!(matches!(arr.fill(2), Err(Error::InvalidResource(_))));
        assert!(matches!(arr.get(4), Err(Error::OutOfRange { .. })));
        cleanup(&name);
    }

    #[test]
    fn test_overflow_is_invalid() {
        let arr = SharedArray::<u64>::create(&unique_name("huge"), usize::MAX);
        assert!(!arr.is_valid());
        assert!(arr.is_empty());
        assert!(matches!(arr.get(0), Err(Error::OutOfRange { .. })));
    }
}
