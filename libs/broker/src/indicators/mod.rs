pub mod dma;
