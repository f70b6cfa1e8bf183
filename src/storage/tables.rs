use redb::TableDefinition;

/// File records: uuid -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Upload index: temporary-store upload id -> file uuid
pub const UPLOAD_FILES: TableDefinition<&str, &str> = TableDefinition::new("upload_files");
