use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{io_error, IndexError};

const MAGIC: &[u8; 8] = b"AULAIDX1";
const HEADER_LEN: usize = 8 + 4 + 8;

/// Exhaustive squared-L2 index over dense `f32` vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// One chunk of a source document, aligned by position with its vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub subject: String,
    pub source: String,
    pub text: String,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn from_vectors(vectors: &[Vec<f32>]) -> Result<Self, String> {
        let dimension = vectors.first().map(Vec::len).unwrap_or(0);
        let mut index = Self::new(dimension);
        for vector in vectors {
            index.add(vector)?;
        }
        Ok(index)
    }

    pub fn add(&mut self, vector: &[f32]) -> Result<(), String> {
        if vector.len() != self.dimension {
            return Err(format!(
                "vector has dimension {}, index expects {}",
                vector.len(),
                self.dimension
            ));
        }
        self.data.extend_from_slice(vector);
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` nearest vectors by squared Euclidean distance, closest first.
    /// A query of the wrong dimension matches nothing.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        if query.len() != self.dimension || self.dimension == 0 || k == 0 {
            return Vec::new();
        }
        let mut neighbors: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, vector)| Neighbor {
                position,
                distance: squared_l2(query, vector),
            })
            .collect();
        neighbors.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });
        neighbors.truncate(k);
        neighbors
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        bytes.extend(self.data.iter().flat_map(|v| v.to_le_bytes()));
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return Err("missing index header".to_string());
        }
        let dimension = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[12..20]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let expected = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| "index size overflows".to_string())?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != expected {
            return Err(format!(
                "payload is {} bytes, header promises {}",
                payload.len(),
                expected
            ));
        }

        let data = payload
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self { dimension, data })
    }

    pub fn write_to(&self, path: &Path) -> Result<(), IndexError> {
        fs::write(path, self.to_bytes()).map_err(io_error(path))
    }

    pub fn read_from(path: &Path) -> Result<Self, IndexError> {
        let bytes = fs::read(path).map_err(io_error(path))?;
        Self::from_bytes(&bytes).map_err(|reason| IndexError::Corrupt {
            path: path.to_path_buf(),
            reason,
        })
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn write_metadata(path: &Path, metadata: &[ChunkMetadata]) -> Result<(), IndexError> {
    let bytes = serde_json::to_vec(metadata).map_err(|source| IndexError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, bytes).map_err(io_error(path))
}

pub fn read_metadata(path: &Path) -> Result<Vec<ChunkMetadata>, IndexError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// A collection loaded into memory for querying.
#[derive(Debug, Clone)]
pub struct LoadedCollection {
    pub subject: String,
    pub index: VectorIndex,
    pub metadata: Vec<ChunkMetadata>,
}

impl LoadedCollection {
    /// Reads an artifact pair, rejecting pairs whose counts disagree.
    pub fn read(subject: &str, index_path: &Path, metadata_path: &Path) -> Result<Self, IndexError> {
        let index = VectorIndex::read_from(index_path)?;
        let metadata = read_metadata(metadata_path)?;
        if index.len() != metadata.len() {
            return Err(IndexError::Corrupt {
                path: metadata_path.to_path_buf(),
                reason: format!(
                    "{} metadata records for {} vectors",
                    metadata.len(),
                    index.len()
                ),
            });
        }
        Ok(Self {
            subject: subject.to_string(),
            index,
            metadata,
        })
    }

    /// Chunks among the `k` nearest whose distance is below `threshold`.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Vec<RetrievedChunk> {
        self.index
            .search(query, k)
            .into_iter()
            .filter(|n| n.distance < threshold)
            .filter_map(|n| {
                self.metadata.get(n.position).map(|m| RetrievedChunk {
                    chunk: m.clone(),
                    distance: n.distance,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: ChunkMetadata,
    pub distance: f32,
}
