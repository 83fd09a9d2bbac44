mod dir_ops;
mod file_ops;
mod metadata_ops;
mod remove_ops;
mod rename_ops;
