#![allow(clippy::cast_possible_truncation)]
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use bp_comm::{CommRef, LocalWorld};
use bp_error::BpError;
use log::LevelFilter;
use rstest::rstest;
use simplelog::{Config, TestLogger};

use crate::index::{MetadataIndex, TailPolicy};
use crate::{
    AggregationType, AttributeValue, BoxRegion, BpOpenOptions, BpReader, BpWriteOptions, BpWriter,
    DEFAULT_REGISTRY, OperatorParams, ReadEngine, Selection, Shape, StepStatus,
};

const BLOCK: usize = 10;

fn init_logging() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
}

fn region(start: &[u64], count: &[u64]) -> BoxRegion {
    BoxRegion::new(start.to_vec(), count.to_vec()).unwrap()
}

fn open_writer(path: &Path, comm: CommRef, options: BpWriteOptions) -> BpWriter {
    BpWriter::open(path, comm, options, DEFAULT_REGISTRY.clone()).unwrap()
}

fn open_reader(path: &Path, options: BpOpenOptions) -> BpReader {
    BpReader::open(
        path,
        LocalWorld::solo(),
        options.with_open_timeout(Duration::ZERO),
        DEFAULT_REGISTRY.clone(),
    )
    .unwrap()
}

fn random_access(path: &Path) -> BpReader {
    open_reader(path, BpOpenOptions::new().random_access())
}

fn block_values(rank: usize, step: usize) -> Vec<f64> {
    (0..BLOCK)
        .map(|i| (step * 1000 + rank * BLOCK + i) as f64)
        .collect()
}

fn field_values(size: usize, step: usize) -> Vec<f64> {
    (0..size * BLOCK).map(|g| (step * 1000 + g) as f64).collect()
}

/// Every rank writes its block of a 1-d global array for `steps` steps. Returns the subfile
/// of each rank.
fn write_field(path: &Path, world: &LocalWorld, options: &BpWriteOptions, steps: usize) -> Vec<usize> {
    world.run(|comm| {
        let rank = comm.rank();
        let size = comm.size();
        let mut writer = open_writer(path, comm, options.clone());
        let field = writer
            .define_variable::<f64>("field", Shape::GlobalArray(vec![(size * BLOCK) as u64]))
            .unwrap();
        for step in 0..steps {
            assert_eq!(writer.begin_step().unwrap(), step);
            writer
                .put(
                    field,
                    &region(&[(rank * BLOCK) as u64], &[BLOCK as u64]),
                    &block_values(rank, step),
                )
                .unwrap();
            writer.end_step().unwrap();
        }
        let subfile = writer.subfile();
        writer.close().unwrap();
        subfile
    })
}

fn dataset_files(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files = fs::read_dir(root)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (
                entry.file_name().to_string_lossy().into_owned(),
                fs::read(entry.path()).unwrap(),
            )
        })
        .collect::<Vec<_>>();
    files.sort();
    files
}

#[test]
fn single_writer_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("single.bp");
    let values: Vec<f64> = (0..100).map(|i| i as f64 * 0.25).collect();

    let mut writer = open_writer(&path, LocalWorld::solo(), BpWriteOptions::new());
    let var = writer
        .define_variable::<f64>("values", Shape::GlobalArray(vec![100]))
        .unwrap();
    writer.begin_step().unwrap();
    writer.put(var, &region(&[0], &[100]), &values).unwrap();
    writer.end_step().unwrap();
    writer.close().unwrap();
    assert_eq!(writer.steps_written(), 1);

    let mut reader = random_access(&path);
    assert_eq!(reader.steps(), 1);
    assert!(!reader.is_writer_active());
    assert_eq!(
        reader.get_sync::<f64>("values", Selection::All, 0).unwrap(),
        values
    );

    let raw: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let data = fs::read(path.join("data.0")).unwrap();
    assert_eq!(&data[..raw.len()], raw.as_slice());
    reader.close().unwrap();
}

#[rstest]
#[case::everyone_writes(AggregationType::EveryoneWrites, 0, usize::MAX)]
#[case::everyone_writes_serial(AggregationType::EveryoneWritesSerial, 0, usize::MAX)]
#[case::shm_two_nodes(AggregationType::TwoLevelShm, 0, 2)]
#[case::shm_aggregator_chains(AggregationType::TwoLevelShm, 4, usize::MAX)]
fn four_writers_two_subfiles(
    #[case] aggregation: AggregationType,
    #[case] aggregators: usize,
    #[case] ranks_per_node: usize,
) {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("field.bp");
    let options = BpWriteOptions::new()
        .with_aggregation_type(aggregation)
        .with_num_aggregators(aggregators)
        .with_num_sub_files(2);
    let world = LocalWorld::new(4).with_ranks_per_node(ranks_per_node);
    let subfiles = write_field(&path, &world, &options, 3);
    assert_eq!(subfiles, vec![0, 0, 1, 1]);

    assert!(path.join("data.0").exists());
    assert!(path.join("data.1").exists());
    assert!(!path.join("data.2").exists());

    let mut reader = random_access(&path);
    assert_eq!(reader.steps(), 3);
    assert_eq!(reader.writer_map(), &[0, 0, 1, 1]);
    for step in 0..3 {
        assert_eq!(
            reader.get_sync::<f64>("field", Selection::All, step).unwrap(),
            field_values(4, step)
        );
        let blocks = reader.blocks_info_at("field", step).unwrap();
        assert_eq!(blocks.iter().map(|b| b.writer).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}

#[test]
fn tiny_shared_buffer_streams_in_many_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.bp");
    let options = BpWriteOptions::new()
        .with_aggregation_type(AggregationType::TwoLevelShm)
        .with_max_shm_size(24);
    write_field(&path, &LocalWorld::new(3), &options, 2);

    let mut reader = random_access(&path);
    assert_eq!(reader.writer_map(), &[0, 0, 0]);
    assert_eq!(
        reader.get_sync::<f64>("field", Selection::All, 1).unwrap(),
        field_values(3, 1)
    );
}

#[test]
fn streaming_reader_waits_for_the_first_step() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.bp");
    let (opened_tx, opened_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel();
    let (written_tx, written_rx) = mpsc::channel();
    let (close_tx, close_rx) = mpsc::channel();

    std::thread::scope(|scope| {
        let writer_path = path.clone();
        scope.spawn(move || {
            let mut writer = open_writer(&writer_path, LocalWorld::solo(), BpWriteOptions::new());
            let var = writer
                .define_variable::<i32>("counter", Shape::GlobalArray(vec![4]))
                .unwrap();
            opened_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            writer.begin_step().unwrap();
            writer.put(var, &region(&[0], &[4]), &[1, 2, 3, 4]).unwrap();
            writer.end_step().unwrap();
            written_tx.send(()).unwrap();
            close_rx.recv().unwrap();
            writer.close().unwrap();
        });

        opened_rx.recv().unwrap();
        let mut reader = BpReader::open(
            &path,
            LocalWorld::solo(),
            BpOpenOptions::new()
                .with_open_timeout(Duration::from_secs(10))
                .with_poll_interval(Duration::from_millis(5)),
            DEFAULT_REGISTRY.clone(),
        )
        .unwrap();
        assert!(reader.is_writer_active());
        assert_eq!(reader.begin_step(Duration::ZERO).unwrap(), StepStatus::NotReady);

        go_tx.send(()).unwrap();
        written_rx.recv().unwrap();
        assert_eq!(
            reader.begin_step(Duration::from_secs(10)).unwrap(),
            StepStatus::Ok
        );
        assert_eq!(reader.current_step(), Some(0));
        let handle = reader.get("counter", Selection::All).unwrap();
        reader.end_step().unwrap();
        assert_eq!(reader.take::<i32>(handle).unwrap(), vec![1, 2, 3, 4]);

        close_tx.send(()).unwrap();
        assert_eq!(
            reader.begin_step(Duration::from_secs(10)).unwrap(),
            StepStatus::EndOfStream
        );
        ReadEngine::close(&mut reader).unwrap();
    });
}

#[test]
fn streaming_readers_agree_across_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agree.bp");
    write_field(&path, &LocalWorld::new(2), &BpWriteOptions::new(), 3);

    let seen = LocalWorld::new(3).run(|comm| {
        let mut reader = BpReader::open(
            &path,
            comm,
            BpOpenOptions::new().with_open_timeout(Duration::ZERO),
            DEFAULT_REGISTRY.clone(),
        )
        .unwrap();
        let mut sums = Vec::new();
        while reader.begin_step(Duration::from_secs(1)).unwrap() == StepStatus::Ok {
            let step = reader.current_step().unwrap();
            let values = reader.get_sync::<f64>("field", Selection::All, step).unwrap();
            sums.push(values.iter().sum::<f64>());
            reader.end_step().unwrap();
        }
        sums
    });
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|sums| sums.len() == 3 && *sums == seen[0]));
}

#[rstest]
#[case::random_access(BpOpenOptions::new().random_access())]
#[case::streaming(BpOpenOptions::new())]
fn truncated_index_keeps_complete_steps(#[case] options: BpOpenOptions) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.bp");
    write_field(&path, &LocalWorld::new(1), &BpWriteOptions::new(), 3);

    // Header, a one-writer map and three single-flush records of four words.
    let index = path.join("md.idx");
    assert_eq!(fs::metadata(&index).unwrap().len(), 64 + 8 + 3 * 32);
    fs::OpenOptions::new()
        .write(true)
        .open(&index)
        .unwrap()
        .set_len(64 + 8 + 2 * 32 + 10)
        .unwrap();

    let mut reader = open_reader(&path, options);
    match reader.mode() {
        crate::ReadMode::RandomAccess => {
            assert_eq!(reader.steps(), 2);
            assert_eq!(
                reader.get_sync::<f64>("field", Selection::All, 1).unwrap(),
                field_values(1, 1)
            );
            assert!(reader.begin_step(Duration::ZERO).is_err());
        }
        crate::ReadMode::Streaming => {
            let mut steps = 0;
            while reader.begin_step(Duration::ZERO).unwrap() == StepStatus::Ok {
                steps += 1;
                reader.end_step().unwrap();
            }
            assert_eq!(steps, 2);
        }
    }
}

#[rstest]
#[case::row_blocks(vec![([0, 0], [2, 6]), ([2, 0], [2, 6])])]
#[case::column_blocks(vec![([0, 0], [4, 3]), ([0, 3], [4, 3])])]
fn sub_box_across_two_writers(#[case] blocks: Vec<([u64; 2], [u64; 2])>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.bp");
    let blocks = &blocks;

    LocalWorld::new(2).run(|comm| {
        let (start, count) = blocks[comm.rank()];
        let mut writer = open_writer(&path, comm, BpWriteOptions::new());
        let grid = writer
            .define_variable::<f64>("grid", Shape::GlobalArray(vec![4, 6]))
            .unwrap();
        let values: Vec<f64> = (start[0]..start[0] + count[0])
            .flat_map(|r| (start[1]..start[1] + count[1]).map(move |c| (r * 6 + c) as f64))
            .collect();
        writer.begin_step().unwrap();
        writer.put(grid, &region(&start, &count), &values).unwrap();
        writer.close().unwrap();
    });

    let mut reader = random_access(&path);
    let values = reader
        .get_sync::<f64>("grid", Selection::bounding_box([1, 2], [2, 3]), 0)
        .unwrap();
    assert_eq!(values, vec![8.0, 9.0, 10.0, 14.0, 15.0, 16.0]);
    assert_eq!(reader.metrics().requests(), 2);

    assert!(matches!(
        reader.get_at_step("grid", Selection::bounding_box([3, 0], [2, 6]), 0),
        Err(BpError::InvalidArgument(..))
    ));
}

#[test]
fn multi_flush_steps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flushes.bp");
    let chunk = |k: usize| -> Vec<f64> { (k * 1000..(k + 1) * 1000).map(|v| v as f64).collect() };

    let mut writer = open_writer(&path, LocalWorld::solo(), BpWriteOptions::new());
    let var = writer
        .define_variable::<f64>("series", Shape::GlobalArray(vec![3000]))
        .unwrap();
    assert!(writer.flush().is_err());
    writer.begin_step().unwrap();
    for k in 0..3 {
        writer
            .put(var, &region(&[(k * 1000) as u64], &[1000]), &chunk(k))
            .unwrap();
        if k < 2 {
            writer.flush().unwrap();
        }
    }
    writer.end_step().unwrap();
    writer.close().unwrap();

    let bytes = fs::read(path.join("md.idx")).unwrap();
    let mut index = MetadataIndex::new(TailPolicy::Truncate);
    assert!(index.parse_index_header(&bytes).unwrap());
    assert_eq!(index.parse_step_records(&bytes, 0, false).unwrap(), 1);
    let record = index.step(0).unwrap();
    assert_eq!(record.flush_count, 3);
    assert_eq!(record.writers[0].flushes, vec![(0, 8000), (8192, 8000)]);
    assert_eq!(record.writers[0].final_pos, 16384);

    let mut reader = random_access(&path);
    let values = reader
        .get_sync::<f64>("series", Selection::bounding_box([900], [1200]), 0)
        .unwrap();
    assert_eq!(values, (900..2100).map(|v| v as f64).collect::<Vec<_>>());
    assert_eq!(
        reader.get_sync::<f64>("series", Selection::All, 0).unwrap(),
        (0..3000).map(|v| v as f64).collect::<Vec<_>>()
    );
}

#[cfg(feature = "bzip2")]
#[test]
fn bzip2_blocks_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compressed.bp");

    LocalWorld::new(2).run(|comm| {
        let rank = comm.rank() as u64;
        let mut writer = open_writer(&path, comm, BpWriteOptions::new());
        let var = writer
            .define_variable::<u32>("levels", Shape::GlobalArray(vec![2, 4096]))
            .unwrap();
        let params = OperatorParams::from([("blockSize100k".to_string(), "5".to_string())]);
        writer.set_operation(var, "bzip2", params).unwrap();
        writer.begin_step().unwrap();
        let values: Vec<u32> = (0..4096).map(|i| (i / 64) as u32 + rank as u32).collect();
        writer.put(var, &region(&[rank, 0], &[1, 4096]), &values).unwrap();
        writer.close().unwrap();
    });

    let mut reader = random_access(&path);
    let blocks = reader.blocks_info_at("levels", 0).unwrap();
    assert!(blocks.iter().all(|b| b.operation.is_some() && b.payload_size < 4096 * 4));
    let row = reader
        .get_sync::<u32>("levels", Selection::bounding_box([1, 100], [1, 200]), 0)
        .unwrap();
    assert_eq!(row, (100..300).map(|i| (i / 64) as u32 + 1).collect::<Vec<_>>());
}

#[test]
fn compiled_out_operators_are_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = open_writer(&dir.path().join("zfp.bp"), LocalWorld::solo(), BpWriteOptions::new());
    let var = writer
        .define_variable::<f32>("pressure", Shape::GlobalArray(vec![8]))
        .unwrap();
    assert!(matches!(
        writer.set_operation(var, "zfp", OperatorParams::new()),
        Err(BpError::UnsupportedCodec(..))
    ));
    writer.close().unwrap();
}

#[test]
fn burst_buffer_output_equals_direct_output() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let direct = dir.path().join("direct").join("run.bp");
    let staged = dir.path().join("staged").join("run.bp");
    let burst_buffer = dir.path().join("bb");
    let options = BpWriteOptions::new().with_aggregation_type(AggregationType::EveryoneWrites);
    let world = LocalWorld::new(3);

    write_field(&direct, &world, &options, 2);
    write_field(
        &staged,
        &world,
        &options.clone().with_burst_buffer(&burst_buffer),
        2,
    );

    assert!(burst_buffer.join("run.bp").join("md.idx").exists());
    assert_eq!(dataset_files(&staged), dataset_files(&direct));
    assert_eq!(
        dataset_files(&burst_buffer.join("run.bp")),
        dataset_files(&direct)
    );
}

#[test]
fn undrained_burst_buffer_leaves_only_the_staged_copy() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("run.bp");
    let burst_buffer = dir.path().join("bb");
    let options = BpWriteOptions::new()
        .with_burst_buffer(&burst_buffer)
        .with_burst_buffer_drain(false);
    write_field(&target, &LocalWorld::new(1), &options, 1);

    assert!(!target.join("md.idx").exists());
    let mut reader = random_access(&burst_buffer.join("run.bp"));
    assert_eq!(
        reader.get_sync::<f64>("field", Selection::All, 0).unwrap(),
        field_values(1, 0)
    );
}

#[cfg(feature = "endian-reverse")]
#[test]
fn foreign_endian_dataset() {
    use crate::Endianness;
    use crate::header::IndexHeader;

    let foreign = match Endianness::native() {
        Endianness::Little => Endianness::Big,
        Endianness::Big => Endianness::Little,
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("foreign.bp");
    let values = [1.5f64, -2.25, 1e10];

    let mut writer = open_writer(
        &path,
        LocalWorld::solo(),
        BpWriteOptions::new().with_endianness(foreign),
    );
    let var = writer
        .define_variable::<f64>("x", Shape::GlobalArray(vec![3]))
        .unwrap();
    let count = writer
        .define_variable::<u16>("count", Shape::GlobalValue)
        .unwrap();
    writer.begin_step().unwrap();
    writer.put(var, &region(&[0], &[3]), &values).unwrap();
    writer.put_value(count, 0x0102).unwrap();
    writer.close().unwrap();

    let header = IndexHeader::decode(&fs::read(path.join("md.idx")).unwrap()).unwrap();
    assert_eq!(header.endianness, foreign);
    let data = fs::read(path.join("data.0")).unwrap();
    let first = match foreign {
        Endianness::Big => 1.5f64.to_be_bytes(),
        Endianness::Little => 1.5f64.to_le_bytes(),
    };
    assert_eq!(&data[..8], first.as_slice());

    let mut reader = random_access(&path);
    assert_eq!(reader.get_sync::<f64>("x", Selection::All, 0).unwrap(), values);
    assert_eq!(reader.get_sync::<u16>("count", Selection::All, 0).unwrap(), vec![0x0102]);
}

#[test]
fn values_local_arrays_and_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.bp");

    LocalWorld::new(3).run(|comm| {
        let rank = comm.rank();
        let mut writer = open_writer(&path, comm, BpWriteOptions::new());
        let step_var = writer
            .define_variable::<u64>("step", Shape::GlobalValue)
            .unwrap();
        let id = writer
            .define_variable::<i32>("rank_id", Shape::LocalValue)
            .unwrap();
        let local = writer
            .define_variable::<u16>("particles", Shape::LocalArray)
            .unwrap();
        if rank == 0 {
            writer.define_attribute("units", "kelvin").unwrap();
            writer.define_attribute("dt", 0.5).unwrap();
        }
        for step in 0..2u64 {
            writer.begin_step().unwrap();
            if rank == 0 {
                writer.put_value(step_var, step).unwrap();
            }
            writer.put_value(id, rank as i32 * 7).unwrap();
            let particles: Vec<u16> = (0..=rank as u16).map(|p| p + step as u16 * 100).collect();
            writer
                .put(local, &region(&[0], &[particles.len() as u64]), &particles)
                .unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    });

    let mut reader = random_access(&path);
    assert_eq!(
        reader.attributes().get("units"),
        Some(&AttributeValue::Text("kelvin".into()))
    );
    assert_eq!(reader.attributes().get("dt"), Some(&AttributeValue::Float(vec![0.5])));
    assert_eq!(reader.get_sync::<u64>("step", Selection::All, 1).unwrap(), vec![1]);
    assert_eq!(reader.variables_at(0).unwrap().len(), 3);
    for writer in 0..3 {
        assert_eq!(
            reader
                .get_sync::<i32>("rank_id", Selection::block(writer, 0), 1)
                .unwrap(),
            vec![writer as i32 * 7]
        );
        let expected: Vec<u16> = (0..=writer as u16).map(|p| p + 100).collect();
        assert_eq!(
            reader
                .get_sync::<u16>("particles", Selection::block(writer, 0), 1)
                .unwrap(),
            expected
        );
    }
    assert!(reader.get_at_step("particles", Selection::All, 0).is_err());
    assert!(matches!(
        reader.get_at_step("missing", Selection::All, 0),
        Err(BpError::NotFound(..))
    ));
}

#[test]
fn adjacent_blocks_are_read_in_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coalesce.bp");
    let mut writer = open_writer(&path, LocalWorld::solo(), BpWriteOptions::new());
    let var = writer
        .define_variable::<f64>("halves", Shape::GlobalArray(vec![100]))
        .unwrap();
    writer.begin_step().unwrap();
    for half in 0..2u64 {
        let values: Vec<f64> = (half * 50..(half + 1) * 50).map(|v| v as f64).collect();
        writer.put(var, &region(&[half * 50], &[50]), &values).unwrap();
    }
    writer.close().unwrap();

    let mut reader = random_access(&path);
    let all = reader.get_sync::<f64>("halves", Selection::All, 0).unwrap();
    assert_eq!(all, (0..100).map(|v| v as f64).collect::<Vec<_>>());
    let metrics = reader.metrics();
    assert_eq!(metrics.requests(), 2);
    assert_eq!(metrics.reads(), 1);
    assert_eq!(metrics.coalesced(), 1);
    assert_eq!(metrics.bytes(), 800);
    assert_eq!(reader.open_subfiles(), 1);
}

#[test]
fn state_machine_misuse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("misuse.bp");

    let mut writer = open_writer(&path, LocalWorld::solo(), BpWriteOptions::new());
    let var = writer
        .define_variable::<i64>("v", Shape::GlobalArray(vec![4]))
        .unwrap();
    assert!(writer.define_variable::<i64>("v", Shape::GlobalArray(vec![4])).is_ok());
    assert!(writer.define_variable::<f32>("v", Shape::GlobalArray(vec![4])).is_err());
    assert!(writer.put(var, &region(&[0], &[4]), &[1, 2, 3, 4]).is_err());
    writer.begin_step().unwrap();
    assert!(writer.begin_step().is_err());
    assert!(writer.put(var, &region(&[2], &[4]), &[1, 2, 3, 4]).is_err());
    assert!(writer.put(var, &region(&[0], &[4]), &[1, 2, 3]).is_err());
    writer.put(var, &region(&[0], &[4]), &[1, 2, 3, 4]).unwrap();
    writer.close().unwrap();
    assert!(writer.begin_step().is_err());

    let mut streaming = open_reader(&path, BpOpenOptions::new());
    assert!(matches!(streaming.perform_gets(), Err(BpError::InvalidArgument(..))));
    assert!(streaming.get("v", Selection::All).is_err());
    assert_eq!(streaming.begin_step(Duration::ZERO).unwrap(), StepStatus::Ok);
    assert!(matches!(
        streaming.begin_step(Duration::ZERO),
        Err(BpError::InvalidArgument(..))
    ));
    let handle = streaming.get("v", Selection::All).unwrap();
    assert!(streaming.take::<i64>(handle).is_err());
    streaming.perform_gets().unwrap();
    assert!(streaming.take::<u8>(handle).is_err());
    assert_eq!(streaming.take::<i64>(handle).unwrap(), vec![1, 2, 3, 4]);
    streaming.end_step().unwrap();
    assert_eq!(
        streaming.begin_step(Duration::ZERO).unwrap(),
        StepStatus::EndOfStream
    );
    streaming.close().unwrap();
    assert!(streaming.begin_step(Duration::ZERO).is_err());

    let mut random = random_access(&path);
    assert!(matches!(
        random.begin_step(Duration::ZERO),
        Err(BpError::InvalidArgument(..))
    ));
    assert!(random.variables().is_err());
    assert_eq!(random.inquire_variable_at("v", 0).unwrap().shape, vec![4]);
}

#[test]
fn missing_dataset_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let result = BpReader::open(
        dir.path().join("nothing.bp"),
        LocalWorld::solo(),
        BpOpenOptions::new().with_open_timeout(Duration::from_millis(20)),
        DEFAULT_REGISTRY.clone(),
    );
    assert!(result.is_err_and(|e| e.is_not_found()));

    let results = LocalWorld::new(2).run(|comm| {
        BpReader::open(
            dir.path().join("nothing.bp"),
            comm,
            BpOpenOptions::new().with_open_timeout(Duration::ZERO),
            DEFAULT_REGISTRY.clone(),
        )
        .is_err_and(|e| e.is_not_found())
    });
    assert_eq!(results, vec![true, true]);
}
