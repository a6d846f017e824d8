use sparse_embedding::checkpoint::{
    encode_records, load_records_from_file, read_records, save_records_to_file, CheckpointRecord,
};
use sparse_embedding::{
    CollectionParams, EmbeddingCollection, EmbeddingError, ShardingScheme, SparseInput,
    TableParams, TablePlacementStrategy,
};

fn trained(table: TableParams) -> EmbeddingCollection<u32> {
    let params = CollectionParams::new(2, 2).with_table(table);
    let mut collection = EmbeddingCollection::new(params).unwrap();
    let input = SparseInput::from_bags(2, 2, &[vec![1, 2], vec![3], vec![4], vec![5, 1]]).unwrap();
    let outputs = collection.forward(&[input]).unwrap();
    let ones: Vec<Vec<f32>> = outputs.iter().map(|o| vec![1.0; o.len()]).collect();
    collection.backward(&ones).unwrap();
    collection.update().unwrap();
    collection
}

fn sorted(mut records: Vec<CheckpointRecord<u32>>) -> Vec<CheckpointRecord<u32>> {
    records.sort_by_key(|r| (r.key, r.slot_id));
    records
}

#[test]
fn test_table_file_round_trip() {
    for table in [
        TableParams::new(64, 3, 2),
        TableParams::new(64, 3, 2).with_sharding(ShardingScheme::DistributedKey),
        TableParams::new(64, 3, 2).with_placement(TablePlacementStrategy::DataParallel),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table0.bin");

        let source = trained(table.clone());
        let written = source.download_table_file(0, &path).unwrap();

        let params = CollectionParams::new(2, 2).with_table(table);
        let mut restored = EmbeddingCollection::<u32>::new(params).unwrap();
        assert_eq!(restored.upload_table_file(0, &path, None).unwrap(), written);

        let original = load_records_from_file::<u32, _>(&path, 3, None).unwrap();
        let mut bytes = Vec::new();
        restored.download_table(0, &mut bytes).unwrap();
        let reloaded = read_records::<u32, _>(bytes.as_slice(), 3, None).unwrap();

        assert_eq!(sorted(reloaded), sorted(original));
        assert_eq!(restored.params_num(), source.params_num());
    }
}

#[test]
fn test_localized_keys_repeat_across_slots() {
    // The same key in two slots is two rows on two devices.
    let source = trained(TableParams::new(64, 3, 2));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table0.bin");
    source.download_table_file(0, &path).unwrap();

    let records = load_records_from_file::<u32, _>(&path, 3, None).unwrap();
    let ones: Vec<_> = records.iter().filter(|r| r.key == 1).collect();
    assert_eq!(ones.len(), 2);
    assert_ne!(ones[0].slot_id, ones[1].slot_id);
}

#[test]
fn test_max_records_limits_upload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.bin");
    let records: Vec<CheckpointRecord<u32>> = (0..10)
        .map(|key| CheckpointRecord {
            key,
            slot_id: (key % 2) as usize,
            vector: vec![key as f32; 3],
        })
        .collect();
    save_records_to_file(&path, &records).unwrap();

    let params = CollectionParams::new(2, 2).with_table(TableParams::new(64, 3, 2));
    let mut collection = EmbeddingCollection::<u32>::new(params).unwrap();
    assert_eq!(collection.upload_table_file(0, &path, Some(4)).unwrap(), 4);
    assert_eq!(collection.params_num(), 4 * 3);
}

#[test]
fn test_truncated_upload_leaves_table_untouched() {
    let records = vec![
        CheckpointRecord {
            key: 1u32,
            slot_id: 0,
            vector: vec![1.0; 3],
        },
        CheckpointRecord {
            key: 2u32,
            slot_id: 1,
            vector: vec![2.0; 3],
        },
    ];
    let mut bytes = encode_records(&records).unwrap();
    bytes.truncate(bytes.len() - 2);

    let params = CollectionParams::new(2, 2).with_table(TableParams::new(64, 3, 2));
    let mut collection = EmbeddingCollection::<u32>::new(params).unwrap();
    let err = collection
        .upload_table(0, bytes.as_slice(), None)
        .unwrap_err();

    assert!(matches!(err, EmbeddingError::Io(_)));
    assert_eq!(collection.params_num(), 0);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let params = CollectionParams::new(1, 1).with_table(TableParams::new(8, 1, 1));
    let mut collection = EmbeddingCollection::<u64>::new(params).unwrap();
    let err = collection
        .upload_table_file(0, dir.path().join("absent.bin"), None)
        .unwrap_err();
    assert!(matches!(err, EmbeddingError::Io(_)));
}
