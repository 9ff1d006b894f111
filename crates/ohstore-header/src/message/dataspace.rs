//! Dataspace message: the extent of a dataset or attribute.

use super::{Codec, Reader, Sharing};
use crate::{HeaderError, Result};

const VERSION: u8 = 2;
const FLAG_MAX_DIMS: u8 = 0x01;
const MAX_RANK: usize = 32;

/// Marks an unlimited maximum dimension
pub const UNLIMITED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataspaceKind {
    #[default]
    Scalar,
    Simple,
    /// No elements at all
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dataspace {
    pub sharing: Sharing,
    pub kind: DataspaceKind,
    pub dims: Vec<u64>,
    pub max_dims: Option<Vec<u64>>,
}

impl Dataspace {
    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn null() -> Self {
        Self {
            kind: DataspaceKind::Null,
            ..Self::default()
        }
    }

    pub fn simple(dims: &[u64]) -> Self {
        Self {
            kind: DataspaceKind::Simple,
            dims: dims.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_max_dims(mut self, max_dims: &[u64]) -> Self {
        self.max_dims = Some(max_dims.to_vec());
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements; saturates instead of overflowing
    pub fn element_count(&self) -> u64 {
        match self.kind {
            DataspaceKind::Scalar => 1,
            DataspaceKind::Null => 0,
            DataspaceKind::Simple => self.dims.iter().fold(1u64, |n, &d| n.saturating_mul(d)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(HeaderError::Argument(reason));
        if self.rank() > MAX_RANK {
            return invalid(format!("dataspace rank {} exceeds {}", self.rank(), MAX_RANK));
        }
        if self.kind != DataspaceKind::Simple && (self.rank() != 0 || self.max_dims.is_some()) {
            return invalid(format!("{:?} dataspace cannot have dimensions", self.kind));
        }
        if let Some(max) = &self.max_dims {
            if max.len() != self.rank() {
                return invalid(format!(
                    "max_dims has rank {}, dims has rank {}",
                    max.len(),
                    self.rank()
                ));
            }
            if let Some((d, m)) = self.dims.iter().zip(max).find(|(d, m)| m < d) {
                return invalid(format!("maximum dimension {} below current {}", m, d));
            }
        }
        Ok(())
    }
}

impl Codec for Dataspace {
    fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "dataspace");
        r.version(VERSION)?;
        let rank = r.u8()? as usize;
        let flags = r.u8()?;
        let kind = match r.u8()? {
            0 => DataspaceKind::Scalar,
            1 => DataspaceKind::Simple,
            2 => DataspaceKind::Null,
            other => return Err(r.error(format!("unknown dataspace kind {}", other))),
        };
        if rank > MAX_RANK || (kind != DataspaceKind::Simple && rank != 0) {
            return Err(r.error(format!("invalid rank {} for {:?}", rank, kind)));
        }

        let dims = (0..rank).map(|_| r.u64()).collect::<Result<Vec<_>>>()?;
        let max_dims = if flags & FLAG_MAX_DIMS != 0 {
            Some((0..rank).map(|_| r.u64()).collect::<Result<Vec<_>>>()?)
        } else {
            None
        };

        Ok(Self {
            sharing: Sharing::Unshared,
            kind,
            dims,
            max_dims,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        out.push(VERSION);
        out.push(self.rank() as u8);
        out.push(if self.max_dims.is_some() { FLAG_MAX_DIMS } else { 0 });
        out.push(match self.kind {
            DataspaceKind::Scalar => 0,
            DataspaceKind::Simple => 1,
            DataspaceKind::Null => 2,
        });
        for d in self.dims.iter().chain(self.max_dims.iter().flatten()) {
            out.extend_from_slice(&d.to_le_bytes());
        }
        Ok(())
    }

    fn raw_size(&self) -> usize {
        let per_dim = if self.max_dims.is_some() { 16 } else { 8 };
        4 + per_dim * self.rank()
    }
}
