mod tests_allocate;
