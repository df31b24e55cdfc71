pub mod testwire_error;
