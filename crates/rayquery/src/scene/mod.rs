pub mod test_scenes;
