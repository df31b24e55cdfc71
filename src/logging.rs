pub mod system_log;
