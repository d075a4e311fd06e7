mod cli_utils;

pub(crate) use cli_utils::CommandBisectbotExt;
