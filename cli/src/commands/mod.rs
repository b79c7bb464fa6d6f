mod diary;
mod foods;
mod helpers;
mod scan;

pub(crate) use diary::{cmd_diary_delete, cmd_diary_show};
pub(crate) use foods::{
    NewReference, cmd_foods_add, cmd_foods_delete, cmd_foods_import, cmd_foods_list,
    cmd_foods_search, cmd_foods_show,
};
pub(crate) use scan::{ScanOptions, cmd_scan};
