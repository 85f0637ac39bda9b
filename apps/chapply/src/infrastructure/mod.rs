pub mod olap;
