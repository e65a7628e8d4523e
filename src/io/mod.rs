pub mod bufcache;
pub mod device;
pub mod xfile;
