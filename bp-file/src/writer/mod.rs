//! The collective writer.
//!
//! Every rank of the communicator opens the same dataset, defines the same variables and
//! calls [`BpWriter::begin_step`], [`BpWriter::flush`], [`BpWriter::end_step`] and
//! [`BpWriter::close`] together. [`BpWriter::put`] is local: it buffers the rank's block
//! until the next flush moves the buffer into the rank's subfile through the aggregation
//! chain.
//!
//! At the end of a step every rank sends rank 0 its block metadata and flush positions.
//! Rank 0 appends them to `mmd.0` and `md.0` and only then to `md.idx`, so a reader that sees
//! a step record can read everything it references.

mod aggregate;
mod dataset;
mod output;
mod variable;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bp_comm::CommRef;
use bp_error::{BpResult, bp_bail, bp_err};
use bp_io::{DrainerOptions, FileDrainer};
pub use variable::*;

use crate::collective::on_root;
use crate::dtype::{NativeType, swap_elements};
use crate::format::Endianness;
use crate::header::IndexHeader;
use crate::metadata::MetaMetadataLog;
use crate::names::DatasetPaths;
use crate::operator::{OperatorParams, OperatorRegistry};
use crate::params::{BpParams, BpWriteOptions};
use crate::schema::{
    Attribute, AttributeBlock, AttributeValue, BlockMeta, FormatDescriptor, VarFormat,
    WriterMetadata,
};
use crate::selection::BoxRegion;
use crate::writer::aggregate::DataWriter;
use crate::writer::dataset::{DatasetFiles, StepContribution};
use crate::writer::output::Placement;

/// Blocks buffered by one rank during the open step.
#[derive(Debug, Default)]
struct StepBuffer {
    /// Payload not flushed yet.
    payload: Vec<u8>,
    /// Bytes produced in this step, flushed or not.
    logical_size: u64,
    flushes: Vec<(u64, u64)>,
    blocks: Vec<BlockMeta>,
    /// Variable ids in the order of their first put; a block's `var_index` points in here.
    order: Vec<usize>,
    ndims: Vec<u32>,
}

impl StepBuffer {
    fn var_index(&mut self, id: usize, ndims: usize) -> u32 {
        let index = match self.order.iter().position(|v| *v == id) {
            Some(index) => index,
            None => {
                self.order.push(id);
                self.ndims.push(ndims as u32);
                self.order.len() - 1
            }
        };
        index as u32
    }
}

/// Writes one dataset collectively over a communicator.
pub struct BpWriter {
    comm: CommRef,
    params: BpParams,
    endianness: Endianness,
    registry: Arc<OperatorRegistry>,
    placement: Placement,
    data: DataWriter,
    /// Only on rank 0.
    files: Option<DatasetFiles>,
    drainer: Option<FileDrainer>,
    variables: Vec<VarDef>,
    attributes: BTreeMap<String, AttributeValue>,
    attributes_dirty: bool,
    sent_formats: MetaMetadataLog,
    step: Option<StepBuffer>,
    steps_written: usize,
    closed: bool,
}

impl BpWriter {
    /// Create the dataset at `path`. Collective on `comm`.
    pub fn open(
        path: impl AsRef<Path>,
        comm: CommRef,
        options: BpWriteOptions,
        registry: Arc<OperatorRegistry>,
    ) -> BpResult<Self> {
        let BpWriteOptions { params, endianness } = options;
        params.validate()?;
        if !cfg!(feature = "endian-reverse") && !endianness.is_native() {
            bp_bail!(InvalidArgument: "writing {endianness} data needs the endian-reverse feature");
        }

        let placement = Placement::new(
            DatasetPaths::new(path.as_ref()),
            params.burst_buffer_path.as_deref(),
            params.burst_buffer_drain,
        );
        on_root(&comm, "create the dataset directory", || placement.create_dirs())?;

        let drainer = placement
            .needs_drainer()
            .then(|| FileDrainer::start(DrainerOptions::default()))
            .transpose()?;
        let data = DataWriter::open(&comm, &params, &placement)?;

        let writer_map = comm.gather_values(data.subfile() as u64, 0)?;
        let header = IndexHeader::new(comm.size() as u32, data.sub_streams() as u32)
            .with_endianness(endianness);
        let files = on_root(&comm, "create the dataset index", || {
            DatasetFiles::create(&placement, header, &writer_map, drainer.as_ref())
        })?;

        if comm.rank() == 0 {
            log::info!(
                "opened {} for writing: {} writers, {} subfiles, {:?}{}",
                placement.target().root().display(),
                comm.size(),
                data.sub_streams(),
                params.aggregation_type,
                if placement.is_staged() { ", burst buffer" } else { "" }
            );
        }

        Ok(Self {
            comm,
            params,
            endianness,
            registry,
            placement,
            data,
            files,
            drainer,
            variables: Vec::new(),
            attributes: BTreeMap::new(),
            attributes_dirty: false,
            sent_formats: MetaMetadataLog::default(),
            step: None,
            steps_written: 0,
            closed: false,
        })
    }

    fn check_open(&self) -> BpResult<()> {
        if self.closed {
            bp_bail!(InvalidArgument: "writer for {} is closed", self.paths().root().display());
        }
        Ok(())
    }

    pub fn paths(&self) -> &DatasetPaths {
        self.placement.target()
    }

    pub fn params(&self) -> &BpParams {
        &self.params
    }

    /// The subfile this rank's data lands in.
    pub fn subfile(&self) -> usize {
        self.data.subfile()
    }

    pub fn steps_written(&self) -> usize {
        self.steps_written
    }

    /// Declare a variable. Declaring an existing name again returns its handle when the type
    /// and shape agree.
    pub fn define_variable<T: NativeType>(
        &mut self,
        name: &str,
        shape: Shape,
    ) -> BpResult<Variable<T>> {
        self.check_open()?;
        if name.is_empty() {
            bp_bail!(InvalidArgument: "variable names must not be empty");
        }
        if let Some(id) = self.variables.iter().position(|v| v.name == name) {
            let existing = &self.variables[id];
            if existing.dtype != T::DTYPE || existing.shape != shape {
                bp_bail!(
                    InvalidArgument: "{name} is already defined as {} {:?}",
                    existing.dtype,
                    existing.shape
                );
            }
            return Ok(Variable::new(id));
        }
        self.variables.push(VarDef {
            name: name.to_string(),
            dtype: T::DTYPE,
            shape,
            operation: None,
        });
        Ok(Variable::new(self.variables.len() - 1))
    }

    /// Encode every later block of `var` with the operator `name`.
    pub fn set_operation<T: NativeType>(
        &mut self,
        var: Variable<T>,
        name: &str,
        params: OperatorParams,
    ) -> BpResult<()> {
        self.check_open()?;
        let operator = self.registry.get(name)?;
        operator.validate_params(&params)?;
        let def = self.variable_mut(var.id)?;
        log::debug!("{} encoded with {}", def.name, operator.name());
        def.operation = Some((operator, params));
        Ok(())
    }

    pub fn define_attribute(&mut self, name: &str, value: impl Into<AttributeValue>) -> BpResult<()> {
        self.check_open()?;
        if name.is_empty() {
            bp_bail!(InvalidArgument: "attribute names must not be empty");
        }
        self.attributes.insert(name.to_string(), value.into());
        self.attributes_dirty = true;
        Ok(())
    }

    fn variable_mut(&mut self, id: usize) -> BpResult<&mut VarDef> {
        let len = self.variables.len();
        self.variables
            .get_mut(id)
            .ok_or_else(|| bp_err!(OutOfBounds: id, 0, len))
    }

    /// Start a new step and return its index.
    pub fn begin_step(&mut self) -> BpResult<usize> {
        self.check_open()?;
        if self.step.is_some() {
            bp_bail!(InvalidArgument: "begin_step called twice without end_step");
        }
        self.step = Some(StepBuffer::default());
        Ok(self.steps_written)
    }

    /// Buffer one block of `var`. `block` is in global coordinates for global arrays, has only
    /// a count for local arrays and no dimensions for values.
    pub fn put<T: NativeType>(
        &mut self,
        var: Variable<T>,
        block: &BoxRegion,
        data: &[T],
    ) -> BpResult<()> {
        self.check_open()?;
        let endianness = self.endianness;
        let def = self
            .variables
            .get(var.id)
            .ok_or_else(|| bp_err!(OutOfBounds: var.id, 0, self.variables.len()))?;
        let step = self
            .step
            .as_mut()
            .ok_or_else(|| bp_err!(InvalidArgument: "put of {} outside a step", def.name))?;
        def.shape.check_block(&def.name, block)?;
        let elements = block.elements();
        if data.len() as u64 != elements {
            bp_bail!(
                InvalidArgument: "block {:?} of {} holds {elements} elements, got {}",
                block.count,
                def.name,
                data.len()
            );
        }
        if elements == 0 {
            log::debug!("skipping empty block of {}", def.name);
            return Ok(());
        }

        let mut raw = Vec::with_capacity(data.len() * T::DTYPE.byte_width());
        T::extend_bytes(data, &mut raw);
        if !endianness.is_native() {
            swap_elements(&mut raw, T::DTYPE.byte_width());
        }
        let (payload, operation) = match &def.operation {
            Some((operator, params)) => {
                let mut info = operator.set_metadata(elements, T::DTYPE, params)?;
                let payload = operator.set_data(&raw, &mut info)?;
                (payload, Some(info))
            }
            None => (raw, None),
        };

        let (shape, start) = match &def.shape {
            Shape::GlobalArray(shape) => (shape.clone(), block.start.clone()),
            _ => (Vec::new(), Vec::new()),
        };
        let var_index = step.var_index(var.id, block.ndims());
        step.blocks.push(BlockMeta {
            var_index,
            shape,
            start,
            count: block.count.clone(),
            payload_offset: step.logical_size,
            payload_size: payload.len() as u64,
            operation,
        });
        step.logical_size += payload.len() as u64;
        step.payload.extend_from_slice(&payload);
        Ok(())
    }

    /// Put a single value.
    pub fn put_value<T: NativeType>(&mut self, var: Variable<T>, value: T) -> BpResult<()> {
        self.put(var, &BoxRegion::default(), &[value])
    }

    /// Move the buffered payload into the subfiles. Collective; a step may be flushed any
    /// number of times before it ends.
    pub fn flush(&mut self) -> BpResult<()> {
        self.check_open()?;
        let step = self
            .step
            .as_mut()
            .ok_or_else(|| bp_err!(InvalidArgument: "flush outside a step"))?;
        let pos = self.data.write(&step.payload, self.drainer.as_ref())?;
        log::debug!(
            "flushed {} bytes of step {} at {pos} in subfile {}",
            step.payload.len(),
            self.steps_written,
            self.data.subfile()
        );
        step.flushes.push((pos, step.payload.len() as u64));
        step.payload.clear();
        Ok(())
    }

    /// Write the rest of the step and publish it. Collective.
    pub fn end_step(&mut self) -> BpResult<()> {
        self.check_open()?;
        let step = self
            .step
            .take()
            .ok_or_else(|| bp_err!(InvalidArgument: "end_step without begin_step"))?;
        let final_pos = self.data.write(&step.payload, self.drainer.as_ref())?;
        let contribution = self.contribution(step, final_pos)?;

        let gathered = self.comm.gather(&contribution.encode()?, 0)?;
        let drainer = self.drainer.as_ref();
        let files = &mut self.files;
        on_root(&self.comm, "append the step to the index", || {
            let files = files
                .as_mut()
                .ok_or_else(|| bp_err!("rank 0 has no index open"))?;
            let contributions = gathered
                .iter()
                .map(|bytes| StepContribution::decode(bytes))
                .collect::<BpResult<Vec<_>>>()?;
            let record = files.append_step(contributions, drainer)?;
            log::debug!(
                "step {}: {} metadata bytes at {}, {} flushes",
                self.steps_written,
                record.metadata_size,
                record.metadata_pos,
                record.flush_count
            );
            Ok(())
        })?;
        self.steps_written += 1;
        Ok(())
    }

    fn contribution(&mut self, step: StepBuffer, final_pos: u64) -> BpResult<StepContribution> {
        let attributes = if self.attributes_dirty {
            self.attributes_dirty = false;
            AttributeBlock {
                attributes: self
                    .attributes
                    .iter()
                    .map(|(name, value)| Attribute {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            }
            .encode()?
        } else {
            Vec::new()
        };

        let (metadata, meta_metadata) = if step.blocks.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let descriptor = FormatDescriptor {
                variables: step
                    .order
                    .iter()
                    .zip(&step.ndims)
                    .map(|(id, ndims)| {
                        let def = &self.variables[*id];
                        VarFormat {
                            name: def.name.clone(),
                            dtype: def.dtype,
                            shape_kind: def.shape.kind(),
                            ndims: *ndims,
                            operator: def.operation.as_ref().map(|(op, _)| op.name().to_string()),
                        }
                    })
                    .collect(),
            };
            let metadata = WriterMetadata {
                format_id: descriptor.id()?,
                data_size: step.logical_size,
                blocks: step.blocks,
            }
            .encode()?;
            let meta_metadata = self
                .sent_formats
                .append_new([descriptor.to_record()?], self.endianness)?;
            (metadata, meta_metadata)
        };

        Ok(StepContribution {
            flushes: step.flushes,
            final_pos,
            metadata,
            attributes,
            meta_metadata,
        })
    }

    /// End the open step, mark the dataset complete and wait for the burst-buffer drain.
    /// Collective. Calling it again is a no-op.
    pub fn close(&mut self) -> BpResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.step.is_some() {
            self.end_step()?;
        }
        self.data.flush()?;
        let drainer = self.drainer.as_ref();
        let files = &mut self.files;
        on_root(&self.comm, "close the index", || match files.as_mut() {
            Some(files) => files.close(drainer),
            None => Ok(()),
        })?;
        self.data.close();
        self.files = None;
        self.closed = true;

        if let Some(mut drainer) = self.drainer.take() {
            let stats = drainer.join();
            log::debug!(
                "drained {} operations, {} bytes, {} errors",
                stats.operations,
                stats.bytes_copied,
                stats.errors
            );
        }
        if self.comm.rank() == 0 {
            log::info!(
                "closed {} after {} steps",
                self.paths().root().display(),
                self.steps_written
            );
        }
        Ok(())
    }
}

impl Drop for BpWriter {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!(
                "writer for {} dropped without close, the index still marks it active",
                self.paths().root().display()
            );
        }
    }
}
